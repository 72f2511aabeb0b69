//! Intrusive, offset-addressed red-black tree.
//!
//! No red-black tree header survived into the original source this
//! workspace was distilled from (only a test file did), so this is a
//! fresh implementation in the spirit of `slist_pre`: nodes are never
//! owned by the tree, only linked through parent/left/right offsets
//! into the same arena the caller already allocated from. Used by the
//! buddy allocator to coalesce adjacent free pages, keyed by their
//! starting offset.
//!
//! Duplicate keys are rejected silently: `emplace` on an existing key
//! is a no-op, since the only caller (coalescing) never produces two
//! free pages at the same offset.

use ctxshm_ptr::{ArenaView, OffsetPtr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Red = 0,
    Black = 1,
}

/// Header embedded at the front of every node the tree manages.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RbNode {
    pub parent: OffsetPtr,
    pub left: OffsetPtr,
    pub right: OffsetPtr,
    pub color: Color,
    pub key: u64,
}

impl RbNode {
    pub const fn new(key: u64) -> Self {
        Self {
            parent: OffsetPtr::null(),
            left: OffsetPtr::null(),
            right: OffsetPtr::null(),
            color: Color::Red,
            key,
        }
    }
}

/// An intrusive red-black tree over [`RbNode`]-headed pages.
#[derive(Debug, Clone, Copy)]
pub struct RbTree {
    root: OffsetPtr,
    size: usize,
}

impl RbTree {
    pub const fn new() -> Self {
        Self { root: OffsetPtr::null(), size: 0 }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// # Safety
    /// `offset` must be a live page at least `size_of::<RbNode>()`
    /// bytes long, not currently linked into this or any other tree.
    pub unsafe fn emplace(&mut self, view: &impl ArenaView, offset: OffsetPtr, key: u64) {
        node_mut(view, offset).write(RbNode::new(key));

        let mut parent = OffsetPtr::null();
        let mut cursor = self.root;
        while !cursor.is_null() {
            parent = cursor;
            let cursor_key = node(view, cursor).key;
            if key == cursor_key {
                // Duplicate: leave the existing node in place and drop
                // this one uninserted.
                return;
            } else if key < cursor_key {
                cursor = node(view, cursor).left;
            } else {
                cursor = node(view, cursor).right;
            }
        }

        node_mut(view, offset).write(RbNode { parent, ..*node(view, offset) });
        if parent.is_null() {
            self.root = offset;
        } else if key < node(view, parent).key {
            (*node_mut(view, parent)).left = offset;
        } else {
            (*node_mut(view, parent)).right = offset;
        }
        self.size += 1;
        self.fixup_insert(view, offset);
    }

    /// Find the offset of the node with exactly `key`, if any.
    pub fn find(&self, view: &impl ArenaView, key: u64) -> Option<OffsetPtr> {
        let mut cursor = self.root;
        while !cursor.is_null() {
            let n = node(view, cursor);
            if key == n.key {
                return Some(cursor);
            } else if key < n.key {
                cursor = n.left;
            } else {
                cursor = n.right;
            }
        }
        None
    }

    /// Find the smallest key strictly greater than or equal to `key`.
    pub fn lower_bound(&self, view: &impl ArenaView, key: u64) -> Option<OffsetPtr> {
        let mut cursor = self.root;
        let mut best = None;
        while !cursor.is_null() {
            let n = node(view, cursor);
            if n.key >= key {
                best = Some(cursor);
                cursor = n.left;
            } else {
                cursor = n.right;
            }
        }
        best
    }

    /// In-order offsets, ascending by key.
    pub fn iter_inorder(&self, view: &impl ArenaView) -> Vec<OffsetPtr> {
        let mut out = Vec::with_capacity(self.size);
        self.inorder_walk(view, self.root, &mut out);
        out
    }

    fn inorder_walk(&self, view: &impl ArenaView, cursor: OffsetPtr, out: &mut Vec<OffsetPtr>) {
        if cursor.is_null() {
            return;
        }
        let n = *node(view, cursor);
        self.inorder_walk(view, n.left, out);
        out.push(cursor);
        self.inorder_walk(view, n.right, out);
    }

    /// Remove the node keyed `key`, returning its offset.
    ///
    /// # Safety
    /// The removed node is unlinked but not zeroed; the caller owns its
    /// memory once this returns.
    pub unsafe fn pop(&mut self, view: &impl ArenaView, key: u64) -> Option<OffsetPtr> {
        let target = self.find(view, key)?;
        self.remove_node(view, target);
        self.size -= 1;
        Some(target)
    }

    // --- CLRS-style rotations and fixups, operating through offsets ---

    unsafe fn rotate_left(&mut self, view: &impl ArenaView, x: OffsetPtr) {
        let y = node(view, x).right;
        (*node_mut(view, x)).right = node(view, y).left;
        let y_left = node(view, y).left;
        if !y_left.is_null() {
            (*node_mut(view, y_left)).parent = x;
        }
        (*node_mut(view, y)).parent = node(view, x).parent;
        let x_parent = node(view, x).parent;
        if x_parent.is_null() {
            self.root = y;
        } else if node(view, x_parent).left.raw() == x.raw() {
            (*node_mut(view, x_parent)).left = y;
        } else {
            (*node_mut(view, x_parent)).right = y;
        }
        (*node_mut(view, y)).left = x;
        (*node_mut(view, x)).parent = y;
    }

    unsafe fn rotate_right(&mut self, view: &impl ArenaView, x: OffsetPtr) {
        let y = node(view, x).left;
        (*node_mut(view, x)).left = node(view, y).right;
        let y_right = node(view, y).right;
        if !y_right.is_null() {
            (*node_mut(view, y_right)).parent = x;
        }
        (*node_mut(view, y)).parent = node(view, x).parent;
        let x_parent = node(view, x).parent;
        if x_parent.is_null() {
            self.root = y;
        } else if node(view, x_parent).right.raw() == x.raw() {
            (*node_mut(view, x_parent)).right = y;
        } else {
            (*node_mut(view, x_parent)).left = y;
        }
        (*node_mut(view, y)).right = x;
        (*node_mut(view, x)).parent = y;
    }

    unsafe fn fixup_insert(&mut self, view: &impl ArenaView, mut z: OffsetPtr) {
        while color_of(view, node(view, z).parent) == Color::Red {
            let parent = node(view, z).parent;
            let grandparent = node(view, parent).parent;
            if parent.raw() == node(view, grandparent).left.raw() {
                let uncle = node(view, grandparent).right;
                if color_of(view, uncle) == Color::Red {
                    (*node_mut(view, parent)).color = Color::Black;
                    (*node_mut(view, uncle)).color = Color::Black;
                    (*node_mut(view, grandparent)).color = Color::Red;
                    z = grandparent;
                } else {
                    if z.raw() == node(view, parent).right.raw() {
                        z = parent;
                        self.rotate_left(view, z);
                    }
                    let parent = node(view, z).parent;
                    let grandparent = node(view, parent).parent;
                    (*node_mut(view, parent)).color = Color::Black;
                    (*node_mut(view, grandparent)).color = Color::Red;
                    self.rotate_right(view, grandparent);
                }
            } else {
                let uncle = node(view, grandparent).left;
                if color_of(view, uncle) == Color::Red {
                    (*node_mut(view, parent)).color = Color::Black;
                    (*node_mut(view, uncle)).color = Color::Black;
                    (*node_mut(view, grandparent)).color = Color::Red;
                    z = grandparent;
                } else {
                    if z.raw() == node(view, parent).left.raw() {
                        z = parent;
                        self.rotate_right(view, z);
                    }
                    let parent = node(view, z).parent;
                    let grandparent = node(view, parent).parent;
                    (*node_mut(view, parent)).color = Color::Black;
                    (*node_mut(view, grandparent)).color = Color::Red;
                    self.rotate_left(view, grandparent);
                }
            }
            if z.raw() == self.root.raw() {
                break;
            }
        }
        (*node_mut(view, self.root)).color = Color::Black;
    }

    unsafe fn transplant(&mut self, view: &impl ArenaView, u: OffsetPtr, v: OffsetPtr) {
        let u_parent = node(view, u).parent;
        if u_parent.is_null() {
            self.root = v;
        } else if node(view, u_parent).left.raw() == u.raw() {
            (*node_mut(view, u_parent)).left = v;
        } else {
            (*node_mut(view, u_parent)).right = v;
        }
        if !v.is_null() {
            (*node_mut(view, v)).parent = u_parent;
        }
    }

    unsafe fn minimum(&self, view: &impl ArenaView, mut x: OffsetPtr) -> OffsetPtr {
        while !node(view, x).left.is_null() {
            x = node(view, x).left;
        }
        x
    }

    unsafe fn remove_node(&mut self, view: &impl ArenaView, z: OffsetPtr) {
        let mut y = z;
        let mut y_original_color = node(view, y).color;
        let x;
        let x_parent;

        if node(view, z).left.is_null() {
            x = node(view, z).right;
            x_parent = node(view, z).parent;
            self.transplant(view, z, x);
        } else if node(view, z).right.is_null() {
            x = node(view, z).left;
            x_parent = node(view, z).parent;
            self.transplant(view, z, x);
        } else {
            y = self.minimum(view, node(view, z).right);
            y_original_color = node(view, y).color;
            x = node(view, y).right;
            if node(view, y).parent.raw() == z.raw() {
                x_parent = y;
                if !x.is_null() {
                    (*node_mut(view, x)).parent = y;
                }
            } else {
                x_parent = node(view, y).parent;
                self.transplant(view, y, x);
                (*node_mut(view, y)).right = node(view, z).right;
                (*node_mut(view, node(view, y).right)).parent = y;
            }
            self.transplant(view, z, y);
            (*node_mut(view, y)).left = node(view, z).left;
            (*node_mut(view, node(view, y).left)).parent = y;
            (*node_mut(view, y)).color = node(view, z).color;
        }

        if y_original_color == Color::Black {
            self.fixup_delete(view, x, x_parent);
        }
    }

    unsafe fn fixup_delete(&mut self, view: &impl ArenaView, mut x: OffsetPtr, mut x_parent: OffsetPtr) {
        while x.raw() != self.root.raw() && color_of(view, x) == Color::Black {
            if x_parent.is_null() {
                break;
            }
            if x.raw() == node(view, x_parent).left.raw() {
                let mut w = node(view, x_parent).right;
                if color_of(view, w) == Color::Red {
                    (*node_mut(view, w)).color = Color::Black;
                    (*node_mut(view, x_parent)).color = Color::Red;
                    self.rotate_left(view, x_parent);
                    w = node(view, x_parent).right;
                }
                let w_left_black = color_of(view, node(view, w).left) == Color::Black;
                let w_right_black = color_of(view, node(view, w).right) == Color::Black;
                if w_left_black && w_right_black {
                    (*node_mut(view, w)).color = Color::Red;
                    x = x_parent;
                    x_parent = node(view, x).parent;
                } else {
                    if w_right_black {
                        (*node_mut(view, node(view, w).left)).color = Color::Black;
                        (*node_mut(view, w)).color = Color::Red;
                        self.rotate_right(view, w);
                        w = node(view, x_parent).right;
                    }
                    (*node_mut(view, w)).color = node(view, x_parent).color;
                    (*node_mut(view, x_parent)).color = Color::Black;
                    (*node_mut(view, node(view, w).right)).color = Color::Black;
                    self.rotate_left(view, x_parent);
                    x = self.root;
                    x_parent = OffsetPtr::null();
                }
            } else {
                let mut w = node(view, x_parent).left;
                if color_of(view, w) == Color::Red {
                    (*node_mut(view, w)).color = Color::Black;
                    (*node_mut(view, x_parent)).color = Color::Red;
                    self.rotate_right(view, x_parent);
                    w = node(view, x_parent).left;
                }
                let w_left_black = color_of(view, node(view, w).left) == Color::Black;
                let w_right_black = color_of(view, node(view, w).right) == Color::Black;
                if w_left_black && w_right_black {
                    (*node_mut(view, w)).color = Color::Red;
                    x = x_parent;
                    x_parent = node(view, x).parent;
                } else {
                    if w_left_black {
                        (*node_mut(view, node(view, w).right)).color = Color::Black;
                        (*node_mut(view, w)).color = Color::Red;
                        self.rotate_left(view, w);
                        w = node(view, x_parent).left;
                    }
                    (*node_mut(view, w)).color = node(view, x_parent).color;
                    (*node_mut(view, x_parent)).color = Color::Black;
                    (*node_mut(view, node(view, w).left)).color = Color::Black;
                    self.rotate_right(view, x_parent);
                    x = self.root;
                    x_parent = OffsetPtr::null();
                }
            }
        }
        if !x.is_null() {
            (*node_mut(view, x)).color = Color::Black;
        }
    }
}

impl Default for RbTree {
    fn default() -> Self {
        Self::new()
    }
}

fn node<'a, V: ArenaView + ?Sized>(view: &'a V, offset: OffsetPtr) -> &'a RbNode {
    // SAFETY: every offset reachable through tree traversal was written
    // by `emplace`, which installs a live RbNode before linking it in.
    unsafe { &*(view.resolve(offset) as *const RbNode) }
}

fn node_mut<'a>(view: &impl ArenaView, offset: OffsetPtr) -> *mut RbNode {
    view.resolve(offset) as *mut RbNode
}

fn color_of(view: &impl ArenaView, offset: OffsetPtr) -> Color {
    if offset.is_null() {
        Color::Black
    } else {
        node(view, offset).color
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxshm_ptr::AllocatorId;

    struct FakeArena {
        bytes: Vec<u8>,
    }

    impl FakeArena {
        fn new(slots: usize) -> Self {
            Self { bytes: vec![0u8; slots * 64] }
        }
    }

    impl ArenaView for FakeArena {
        fn allocator_id(&self) -> AllocatorId {
            AllocatorId::null()
        }
        fn arena_base(&self) -> *mut u8 {
            self.bytes.as_ptr() as *mut u8
        }
        fn data_range(&self) -> (*mut u8, *mut u8) {
            let start = self.arena_base();
            (start, unsafe { start.add(self.bytes.len()) })
        }
    }

    #[test]
    fn test_insert_and_find() {
        let arena = FakeArena::new(8);
        let mut tree = RbTree::new();
        let keys = [500u64, 100, 900, 300, 700, 200, 800, 400];
        unsafe {
            for (i, &k) in keys.iter().enumerate() {
                tree.emplace(&arena, OffsetPtr::new((i * 64) as u64), k);
            }
        }
        assert_eq!(tree.len(), keys.len());
        for &k in &keys {
            assert!(tree.find(&arena, k).is_some());
        }
        assert!(tree.find(&arena, 999).is_none());
    }

    #[test]
    fn test_inorder_is_sorted() {
        let arena = FakeArena::new(6);
        let mut tree = RbTree::new();
        let keys = [50u64, 10, 90, 30, 70, 20];
        unsafe {
            for (i, &k) in keys.iter().enumerate() {
                tree.emplace(&arena, OffsetPtr::new((i * 64) as u64), k);
            }
        }
        let order: Vec<u64> = tree.iter_inorder(&arena).iter().map(|&off| node(&arena, off).key).collect();
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_duplicate_emplace_is_noop() {
        let arena = FakeArena::new(4);
        let mut tree = RbTree::new();
        unsafe {
            tree.emplace(&arena, OffsetPtr::new(0), 10);
            tree.emplace(&arena, OffsetPtr::new(64), 10);
        }
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_remove_preserves_remaining_keys() {
        let arena = FakeArena::new(8);
        let mut tree = RbTree::new();
        let keys = [500u64, 100, 900, 300, 700, 200, 800, 400];
        unsafe {
            for (i, &k) in keys.iter().enumerate() {
                tree.emplace(&arena, OffsetPtr::new((i * 64) as u64), k);
            }
            tree.pop(&arena, 300);
            tree.pop(&arena, 500);
        }
        assert_eq!(tree.len(), 6);
        assert!(tree.find(&arena, 300).is_none());
        assert!(tree.find(&arena, 500).is_none());
        for &k in &[100, 900, 700, 200, 800, 400] {
            assert!(tree.find(&arena, k).is_some(), "missing key {k}");
        }
    }
}
