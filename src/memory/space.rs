use parking_lot::Mutex;

use crate::base::constants::OBJECT_HEADER_SIZE;

use super::{free_list::FreeList, page::PagePtr};

/// Where instances of a type are allocated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum SpaceSelector {
    /// Regular spaces, picked by size.
    Regular,
    /// The custom space with this index, in configuration order.
    Custom(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct SpaceIndex(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum RegularSpaceType {
    Normal1,
    Normal2,
    Normal3,
    Normal4,
    Large,
}

pub const REGULAR_SPACE_COUNT: usize = 5;

impl RegularSpaceType {
    pub const fn index(self) -> SpaceIndex {
        SpaceIndex(self as usize)
    }

    /// Size class for an allocation of `size` bytes, header included.
    pub fn for_size(size: usize) -> Self {
        if size <= 32 {
            Self::Normal1
        } else if size <= 64 {
            Self::Normal2
        } else if size <= 128 {
            Self::Normal3
        } else {
            Self::Normal4
        }
    }
}

/// Resolves a selector to a concrete space, or `None` if the custom index was
/// never configured.
pub fn resolve_space(selector: SpaceSelector, payload_size: usize, custom_spaces: usize) -> Option<SpaceIndex> {
    match selector {
        SpaceSelector::Regular => Some(RegularSpaceType::for_size(payload_size + OBJECT_HEADER_SIZE).index()),
        SpaceSelector::Custom(index) if index < custom_spaces => Some(SpaceIndex(REGULAR_SPACE_COUNT + index)),
        SpaceSelector::Custom(_) => None,
    }
}

/// Describes a custom space at heap construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomSpaceConfig {
    pub name: String,
}

impl CustomSpaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceKind {
    Normal,
    Large,
}

pub struct SpaceState {
    pub pages: Vec<PagePtr>,
    pub free_list: FreeList,
}

/// Pages of one category plus the free list built from them.
pub struct Space {
    index: SpaceIndex,
    kind: SpaceKind,
    name: String,
    state: Mutex<SpaceState>,
}

impl Space {
    pub fn new(index: SpaceIndex, kind: SpaceKind, name: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            name: name.into(),
            state: Mutex::new(SpaceState {
                pages: Vec::new(),
                free_list: FreeList::new(),
            }),
        }
    }

    pub fn index(&self) -> SpaceIndex {
        self.index
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_custom(&self) -> bool {
        self.index.0 >= REGULAR_SPACE_COUNT
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    pub fn add_page(&self, page: PagePtr) {
        self.state.lock().pages.push(page);
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn contains_page(&self, page: PagePtr) -> bool {
        self.state.lock().pages.contains(&page)
    }
}

pub fn create_spaces(custom: &[CustomSpaceConfig]) -> Vec<Space> {
    let mut spaces = vec![
        Space::new(RegularSpaceType::Normal1.index(), SpaceKind::Normal, "normal1"),
        Space::new(RegularSpaceType::Normal2.index(), SpaceKind::Normal, "normal2"),
        Space::new(RegularSpaceType::Normal3.index(), SpaceKind::Normal, "normal3"),
        Space::new(RegularSpaceType::Normal4.index(), SpaceKind::Normal, "normal4"),
        Space::new(RegularSpaceType::Large.index(), SpaceKind::Large, "large"),
    ];
    for (i, config) in custom.iter().enumerate() {
        spaces.push(Space::new(
            SpaceIndex(REGULAR_SPACE_COUNT + i),
            SpaceKind::Normal,
            config.name.clone(),
        ));
    }
    spaces
}
