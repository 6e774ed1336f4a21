use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
};

/// The three kinds of raw change the rename detector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl FileChange {
    pub fn new<P: Into<PathBuf>>(kind: ChangeKind, path: P) -> Self {
        FileChange {
            kind,
            path: path.into(),
        }
    }

    pub fn added<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(ChangeKind::Added, path)
    }

    pub fn modified<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(ChangeKind::Modified, path)
    }

    pub fn deleted<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(ChangeKind::Deleted, path)
    }

    /// Flatten a `notify` event into added/modified/deleted changes.
    ///
    /// Renames are split into a deletion of the old path and an addition of the new one, so that
    /// moves are only ever recognized by the rename detector's correlation. Access and other
    /// events carry no change and are dropped, as are hidden files (the identity database lives
    /// next to the documents).
    pub fn from_notify(event: &Event) -> Vec<FileChange> {
        let visible = event.paths.iter().filter(|path| !is_hidden(path));
        match event.kind {
            EventKind::Create(_) => visible.map(FileChange::added).collect(),
            EventKind::Remove(_) => visible.map(FileChange::deleted).collect(),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => visible.map(FileChange::deleted).collect(),
                RenameMode::To => visible.map(FileChange::added).collect(),
                RenameMode::Both => {
                    // paths[0] is the source, paths[1] the destination
                    let mut changes = Vec::with_capacity(2);
                    if let Some(from) = event.paths.first().filter(|p| !is_hidden(p)) {
                        changes.push(FileChange::deleted(from));
                    }
                    if let Some(to) = event.paths.get(1).filter(|p| !is_hidden(p)) {
                        changes.push(FileChange::added(to));
                    }
                    changes
                }
                RenameMode::Any | RenameMode::Other => visible
                    .map(|path| {
                        if path.exists() {
                            FileChange::added(path)
                        } else {
                            FileChange::deleted(path)
                        }
                    })
                    .collect(),
            },
            EventKind::Modify(_) => visible.map(FileChange::modified).collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }
}

impl Display for FileChange {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} {:?}", self.kind, self.path)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
