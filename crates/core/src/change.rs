//! Change records emitted by versioned collections.
//!
//! Every mutation of a collection is described by exactly one `ChangeEvent`
//! tagged with the collection version it produced. Versions of one stream are
//! strictly increasing and gap-free, so a consumer can replay them in order.

/// Sequence number of a change within one stream.
pub type Version = u64;

/// Element types that can flow through collections and operators.
pub trait Item: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Item for T {}

/// Shape of a change record, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Reset,
    Inserted,
    Removed,
    Replaced,
}

/// One versioned edit of an ordered collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent<T> {
    /// The content changed wholesale; consumers must rebuild from a snapshot.
    Reset { version: Version },
    /// `items` were inserted so that the first one now sits at `start`.
    Inserted {
        version: Version,
        start: usize,
        items: Vec<T>,
    },
    /// The contiguous run `items` was removed starting at `start`.
    Removed {
        version: Version,
        start: usize,
        items: Vec<T>,
    },
    /// Parallel arrays: `indices[i]` went from `old_items[i]` to `new_items[i]`.
    Replaced {
        version: Version,
        indices: Vec<usize>,
        old_items: Vec<T>,
        new_items: Vec<T>,
    },
}

impl<T> ChangeEvent<T> {
    /// Returns the version this change produced.
    #[inline]
    pub fn version(&self) -> Version {
        match self {
            ChangeEvent::Reset { version }
            | ChangeEvent::Inserted { version, .. }
            | ChangeEvent::Removed { version, .. }
            | ChangeEvent::Replaced { version, .. } => *version,
        }
    }

    /// Returns the shape of this change.
    #[inline]
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Reset { .. } => ChangeKind::Reset,
            ChangeEvent::Inserted { .. } => ChangeKind::Inserted,
            ChangeEvent::Removed { .. } => ChangeKind::Removed,
            ChangeEvent::Replaced { .. } => ChangeKind::Replaced,
        }
    }

    /// Returns true if this is a reset.
    #[inline]
    pub fn is_reset(&self) -> bool {
        matches!(self, ChangeEvent::Reset { .. })
    }

    /// Returns the number of elements touched by this change.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            ChangeEvent::Reset { .. } => 0,
            ChangeEvent::Inserted { items, .. } | ChangeEvent::Removed { items, .. } => items.len(),
            ChangeEvent::Replaced { indices, .. } => indices.len(),
        }
    }

    /// Returns true if this change touches no element.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserted or removed items, or the new values of a replacement.
    pub fn items(&self) -> &[T] {
        match self {
            ChangeEvent::Reset { .. } => &[],
            ChangeEvent::Inserted { items, .. } | ChangeEvent::Removed { items, .. } => items,
            ChangeEvent::Replaced { new_items, .. } => new_items,
        }
    }

    /// Consumes the change and returns the same items as [`ChangeEvent::items`].
    pub fn into_items(self) -> Vec<T> {
        match self {
            ChangeEvent::Reset { .. } => Vec::new(),
            ChangeEvent::Inserted { items, .. } | ChangeEvent::Removed { items, .. } => items,
            ChangeEvent::Replaced { new_items, .. } => new_items,
        }
    }

    /// Returns the same change relabelled with another version.
    pub fn with_version(mut self, new_version: Version) -> Self {
        match &mut self {
            ChangeEvent::Reset { version }
            | ChangeEvent::Inserted { version, .. }
            | ChangeEvent::Removed { version, .. }
            | ChangeEvent::Replaced { version, .. } => *version = new_version,
        }
        self
    }
}
