//! Path-addressed resources.
//!
//! A [`Node`] is a snapshot of one resource in the tree: stable id, path,
//! permissions and etag, plus a [`NodeKind`] for the parts that differ
//! between files and collections.

use std::time::SystemTime;

use bitflags::bitflags;

/// Stable resource identifier. Survives renames.
pub type FileId = u64;

bitflags! {
    /// Permission bitmask carried by every node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const READ = 1;
        const UPDATE = 2;
        const CREATE = 4;
        const DELETE = 8;
        const SHARE = 16;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::all()
    }
}

/// File-only or collection-only attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File {
        content_type: String,
        /// `ALGO:hex` checksum of the stored content, when known.
        checksum: Option<String>,
    },
    Directory,
}

/// One resource in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: FileId,
    /// Normalized path, no leading or trailing slash. The root is `""`.
    pub path: String,
    pub permissions: Permissions,
    /// Unquoted entity tag.
    pub etag: String,
    /// Owner user id. A reference only; resolve through the user backend.
    pub owner: Option<String>,
    /// Content length for files, total content size for collections.
    pub size: u64,
    pub modified: SystemTime,
    /// Resource lives on a mount shared with the current user.
    pub shared: bool,
    /// Resource lives on an external or shared mount.
    pub mounted: bool,
    pub kind: NodeKind,
}

impl Node {
    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Quoted etag as used in HTTP headers.
    pub fn quoted_etag(&self) -> String {
        format!("\"{}\"", self.etag)
    }

    pub fn content_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { content_type, .. } => Some(content_type),
            NodeKind::Directory => None,
        }
    }

    pub fn checksum(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { checksum, .. } => checksum.as_deref(),
            NodeKind::Directory => None,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.permissions.contains(Permissions::READ)
    }

    pub fn is_deletable(&self) -> bool {
        self.permissions.contains(Permissions::DELETE)
    }

    /// Permission string advertised to sync clients.
    ///
    /// `S` shared, `R` reshareable, `M` mounted, `G` readable, `D` deletable,
    /// `NV` renameable/movable, `W` writable file, `CK` creatable in a folder.
    pub fn dav_permissions(&self) -> String {
        let mut p = String::new();
        if self.shared {
            p.push('S');
        }
        if self.permissions.contains(Permissions::SHARE) {
            p.push('R');
        }
        if self.mounted {
            p.push('M');
        }
        if self.permissions.contains(Permissions::READ) {
            p.push('G');
        }
        if self.permissions.contains(Permissions::DELETE) {
            p.push('D');
        }
        if self.permissions.contains(Permissions::UPDATE) {
            p.push_str("NV");
        }
        match self.kind {
            NodeKind::File { .. } => {
                if self.permissions.contains(Permissions::UPDATE) {
                    p.push('W');
                }
            }
            NodeKind::Directory => {
                if self.permissions.contains(Permissions::CREATE) {
                    p.push_str("CK");
                }
            }
        }
        p
    }
}
