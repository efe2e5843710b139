//! Red-black tree primitive (spec §4.F).
//!
//! The source's `anchor: **rbt_node` (a pointer into whichever parent slot
//! holds this node — left child, right child, or the tree's root field)
//! doesn't translate to safe Rust. Per the redesign note in spec §9 we use
//! an `Anchor` enum tagging which slot a node occupies instead; rotations
//! and transplants match on it rather than branching on "is this the root".
//!
//! Ordering is supplied by an external comparator rather than requiring
//! `K: Ord`, so a hash table bucket can order nodes by its own
//! `hash_func_rbt`/`compare_key` pair (spec §4.G) instead of a fixed trait
//! impl.

use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// Tags which slot of its parent (or the tree root field) currently holds a
/// node — the redesigned replacement for the source's `**rbt_node` anchor.
enum Anchor<K> {
    Root,
    Left(*mut RbNode<K>),
    Right(*mut RbNode<K>),
}

struct RbNode<K> {
    color: Color,
    anchor: Anchor<K>,
    parent: *mut RbNode<K>,
    left: *mut RbNode<K>,
    right: *mut RbNode<K>,
    value: K,
}

/// A handle to a live node, opaque to callers. Valid only for the
/// [`RbTree`] it was returned from.
#[derive(Clone, Copy)]
pub struct NodeHandle<K>(*mut RbNode<K>);

impl<K> PartialEq for NodeHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

pub struct RbTree<K> {
    root: *mut RbNode<K>,
    leftmost: *mut RbNode<K>,
    rightmost: *mut RbNode<K>,
    count: usize,
    compare: Comparator<K>,
}

unsafe impl<K: Send> Send for RbTree<K> {}

fn color_of<K>(n: *mut RbNode<K>) -> Color {
    if n.is_null() {
        Color::Black
    } else {
        unsafe { (*n).color }
    }
}

impl<K> RbTree<K> {
    pub fn new(compare: impl Fn(&K, &K) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            root: std::ptr::null_mut(),
            leftmost: std::ptr::null_mut(),
            rightmost: std::ptr::null_mut(),
            count: 0,
            compare: Arc::new(compare),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn leftmost(&self) -> Option<&K> {
        unsafe { self.leftmost.as_ref().map(|n| &n.value) }
    }

    pub fn rightmost(&self) -> Option<&K> {
        unsafe { self.rightmost.as_ref().map(|n| &n.value) }
    }

    /// `find`: exact match, or `None` if the tree is empty or has no equal key.
    pub fn find(&self, key: &K) -> Option<NodeHandle<K>> {
        let mut cur = self.root;
        while !cur.is_null() {
            let ord = (self.compare)(key, unsafe { &(*cur).value });
            cur = match ord {
                Ordering::Equal => return Some(NodeHandle(cur)),
                Ordering::Less => unsafe { (*cur).left },
                Ordering::Greater => unsafe { (*cur).right },
            };
        }
        None
    }

    /// Search with an arbitrary comparator against the stored value,
    /// ordered the same way `compare` orders `K`. Lets a caller (a hash
    /// table bucket) probe by a bare key without building a placeholder `K`.
    /// `cmp(node_value)` returns the target's order relative to the node.
    pub fn find_by<F>(&self, cmp: F) -> Option<NodeHandle<K>>
    where
        F: Fn(&K) -> Ordering,
    {
        let mut cur = self.root;
        while !cur.is_null() {
            let ord = cmp(unsafe { &(*cur).value });
            cur = match ord {
                Ordering::Equal => return Some(NodeHandle(cur)),
                Ordering::Less => unsafe { (*cur).left },
                Ordering::Greater => unsafe { (*cur).right },
            };
        }
        None
    }

    /// `find_left`: the first-inserted node equal to `key`, i.e. the
    /// in-order-earliest node in its duplicate run.
    pub fn find_left(&self, key: &K) -> Option<NodeHandle<K>> {
        let mut cur = self.find(key)?;
        while let Some(prev) = self.decrement(cur) {
            if (self.compare)(key, self.value(prev)) == Ordering::Equal {
                cur = prev;
            } else {
                break;
            }
        }
        Some(cur)
    }

    pub fn value(&self, handle: NodeHandle<K>) -> &K {
        unsafe { &(*handle.0).value }
    }

    pub fn value_mut(&mut self, handle: NodeHandle<K>) -> &mut K {
        unsafe { &mut (*handle.0).value }
    }

    /// `insert`: duplicate keys (per `compare`) descend to the right at
    /// every equal comparison, preserving stable insertion order among
    /// equal keys under in-order iteration (spec §4.F duplicate-key policy).
    pub fn insert(&mut self, value: K) -> NodeHandle<K> {
        let node = Box::into_raw(Box::new(RbNode {
            color: Color::Red,
            anchor: Anchor::Root,
            parent: std::ptr::null_mut(),
            left: std::ptr::null_mut(),
            right: std::ptr::null_mut(),
            value,
        }));

        if self.root.is_null() {
            unsafe { (*node).color = Color::Black };
            self.root = node;
            self.leftmost = node;
            self.rightmost = node;
            self.count += 1;
            return NodeHandle(node);
        }

        // Equal keys are treated as "go right": a duplicate always descends
        // past every previously inserted equal key before it can land, which
        // places it immediately after them in in-order position and keeps
        // iteration over a duplicate run in FIFO insertion order.
        let mut parent = std::ptr::null_mut();
        let mut cur = self.root;
        let mut go_left = true;
        while !cur.is_null() {
            parent = cur;
            let ord = (self.compare)(unsafe { &(*node).value }, unsafe { &(*cur).value });
            match ord {
                Ordering::Less => {
                    go_left = true;
                    cur = unsafe { (*cur).left };
                }
                Ordering::Greater | Ordering::Equal => {
                    go_left = false;
                    cur = unsafe { (*cur).right };
                }
            }
        }

        unsafe {
            (*node).parent = parent;
            if go_left {
                (*parent).left = node;
                (*node).anchor = Anchor::Left(parent);
            } else {
                (*parent).right = node;
                (*node).anchor = Anchor::Right(parent);
            }
        }

        self.count += 1;
        unsafe {
            if self.leftmost.is_null() || (self.compare)(&(*node).value, &(*self.leftmost).value) == Ordering::Less {
                self.leftmost = node;
            }
            if self.rightmost.is_null() || (self.compare)(&(*node).value, &(*self.rightmost).value) != Ordering::Less {
                self.rightmost = node;
            }
        }
        self.insert_fixup(node);
        NodeHandle(node)
    }

    fn rotate_left(&mut self, x: *mut RbNode<K>) {
        unsafe {
            let y = (*x).right;
            (*x).right = (*y).left;
            if !(*y).left.is_null() {
                (*(*y).left).parent = x;
                (*(*y).left).anchor = Anchor::Right(x);
            }
            (*y).parent = (*x).parent;
            match (*x).anchor {
                Anchor::Root => {
                    self.root = y;
                    (*y).anchor = Anchor::Root;
                }
                Anchor::Left(p) => {
                    (*p).left = y;
                    (*y).anchor = Anchor::Left(p);
                }
                Anchor::Right(p) => {
                    (*p).right = y;
                    (*y).anchor = Anchor::Right(p);
                }
            }
            (*y).left = x;
            (*x).parent = y;
            (*x).anchor = Anchor::Left(y);
        }
    }

    fn rotate_right(&mut self, x: *mut RbNode<K>) {
        unsafe {
            let y = (*x).left;
            (*x).left = (*y).right;
            if !(*y).right.is_null() {
                (*(*y).right).parent = x;
                (*(*y).right).anchor = Anchor::Left(x);
            }
            (*y).parent = (*x).parent;
            match (*x).anchor {
                Anchor::Root => {
                    self.root = y;
                    (*y).anchor = Anchor::Root;
                }
                Anchor::Left(p) => {
                    (*p).left = y;
                    (*y).anchor = Anchor::Left(p);
                }
                Anchor::Right(p) => {
                    (*p).right = y;
                    (*y).anchor = Anchor::Right(p);
                }
            }
            (*y).right = x;
            (*x).parent = y;
            (*x).anchor = Anchor::Right(y);
        }
    }

    fn insert_fixup(&mut self, mut z: *mut RbNode<K>) {
        unsafe {
            while color_of((*z).parent) == Color::Red {
                let parent = (*z).parent;
                let grandparent = (*parent).parent;
                if grandparent.is_null() {
                    break;
                }
                if parent == (*grandparent).left {
                    let uncle = (*grandparent).right;
                    if color_of(uncle) == Color::Red {
                        (*parent).color = Color::Black;
                        (*uncle).color = Color::Black;
                        (*grandparent).color = Color::Red;
                        z = grandparent;
                    } else {
                        if z == (*parent).right {
                            z = parent;
                            self.rotate_left(z);
                        }
                        let parent = (*z).parent;
                        let grandparent = (*parent).parent;
                        (*parent).color = Color::Black;
                        (*grandparent).color = Color::Red;
                        self.rotate_right(grandparent);
                    }
                } else {
                    let uncle = (*grandparent).left;
                    if color_of(uncle) == Color::Red {
                        (*parent).color = Color::Black;
                        (*uncle).color = Color::Black;
                        (*grandparent).color = Color::Red;
                        z = grandparent;
                    } else {
                        if z == (*parent).left {
                            z = parent;
                            self.rotate_right(z);
                        }
                        let parent = (*z).parent;
                        let grandparent = (*parent).parent;
                        (*parent).color = Color::Black;
                        (*grandparent).color = Color::Red;
                        self.rotate_left(grandparent);
                    }
                }
            }
            (*self.root).color = Color::Black;
        }
    }

    fn transplant(&mut self, u: *mut RbNode<K>, v: *mut RbNode<K>) {
        unsafe {
            let p = (*u).parent;
            match (*u).anchor {
                Anchor::Root => {
                    self.root = v;
                    if !v.is_null() {
                        (*v).anchor = Anchor::Root;
                    }
                }
                Anchor::Left(_) => {
                    (*p).left = v;
                    if !v.is_null() {
                        (*v).anchor = Anchor::Left(p);
                    }
                }
                Anchor::Right(_) => {
                    (*p).right = v;
                    if !v.is_null() {
                        (*v).anchor = Anchor::Right(p);
                    }
                }
            }
            if !v.is_null() {
                (*v).parent = p;
            }
        }
    }

    fn minimum(node: *mut RbNode<K>) -> *mut RbNode<K> {
        let mut cur = node;
        unsafe {
            while !(*cur).left.is_null() {
                cur = (*cur).left;
            }
        }
        cur
    }

    fn maximum(node: *mut RbNode<K>) -> *mut RbNode<K> {
        let mut cur = node;
        unsafe {
            while !(*cur).right.is_null() {
                cur = (*cur).right;
            }
        }
        cur
    }

    /// `unlink`: standard red-black deletion. Returns the removed value.
    pub fn unlink(&mut self, handle: NodeHandle<K>) -> K {
        let z = handle.0;
        let was_leftmost = z == self.leftmost;
        let was_rightmost = z == self.rightmost;

        let mut y = z;
        let mut y_original_color = color_of(y);
        let x;
        let x_parent;

        unsafe {
            if (*z).left.is_null() {
                x = (*z).right;
                x_parent = (*z).parent;
                self.transplant(z, (*z).right);
            } else if (*z).right.is_null() {
                x = (*z).left;
                x_parent = (*z).parent;
                self.transplant(z, (*z).left);
            } else {
                y = Self::minimum((*z).right);
                y_original_color = color_of(y);
                x = (*y).right;
                if (*y).parent == z {
                    x_parent = y;
                    if !x.is_null() {
                        (*x).parent = y;
                    }
                } else {
                    x_parent = (*y).parent;
                    self.transplant(y, (*y).right);
                    (*y).right = (*z).right;
                    (*(*y).right).parent = y;
                    (*(*y).right).anchor = Anchor::Right(y);
                }
                self.transplant(z, y);
                (*y).left = (*z).left;
                (*(*y).left).parent = y;
                (*(*y).left).anchor = Anchor::Left(y);
                (*y).color = (*z).color;
            }

            if was_leftmost {
                self.leftmost = if x.is_null() { x_parent } else { Self::minimum(x) };
                if self.leftmost.is_null() {
                    self.leftmost = x_parent;
                }
            }
            if was_rightmost {
                self.rightmost = if x.is_null() { x_parent } else { Self::maximum(x) };
                if self.rightmost.is_null() {
                    self.rightmost = x_parent;
                }
            }

            if y_original_color == Color::Black {
                self.delete_fixup(x, x_parent);
            }

            self.count -= 1;
            if self.root.is_null() {
                self.leftmost = std::ptr::null_mut();
                self.rightmost = std::ptr::null_mut();
            } else {
                if self.leftmost.is_null() {
                    self.leftmost = Self::minimum(self.root);
                }
                if self.rightmost.is_null() {
                    self.rightmost = Self::maximum(self.root);
                }
            }

            let boxed = Box::from_raw(z);
            boxed.value
        }
    }

    fn delete_fixup(&mut self, mut x: *mut RbNode<K>, mut x_parent: *mut RbNode<K>) {
        unsafe {
            while x != self.root && color_of(x) == Color::Black {
                if x_parent.is_null() {
                    break;
                }
                if x == (*x_parent).left {
                    let mut w = (*x_parent).right;
                    if w.is_null() {
                        break;
                    }
                    if color_of(w) == Color::Red {
                        (*w).color = Color::Black;
                        (*x_parent).color = Color::Red;
                        self.rotate_left(x_parent);
                        w = (*x_parent).right;
                    }
                    if color_of((*w).left) == Color::Black && color_of((*w).right) == Color::Black {
                        (*w).color = Color::Red;
                        x = x_parent;
                        x_parent = (*x).parent;
                    } else {
                        if color_of((*w).right) == Color::Black {
                            if !(*w).left.is_null() {
                                (*(*w).left).color = Color::Black;
                            }
                            (*w).color = Color::Red;
                            self.rotate_right(w);
                            w = (*x_parent).right;
                        }
                        (*w).color = (*x_parent).color;
                        (*x_parent).color = Color::Black;
                        if !(*w).right.is_null() {
                            (*(*w).right).color = Color::Black;
                        }
                        self.rotate_left(x_parent);
                        x = self.root;
                        x_parent = std::ptr::null_mut();
                    }
                } else {
                    let mut w = (*x_parent).left;
                    if w.is_null() {
                        break;
                    }
                    if color_of(w) == Color::Red {
                        (*w).color = Color::Black;
                        (*x_parent).color = Color::Red;
                        self.rotate_right(x_parent);
                        w = (*x_parent).left;
                    }
                    if color_of((*w).right) == Color::Black && color_of((*w).left) == Color::Black {
                        (*w).color = Color::Red;
                        x = x_parent;
                        x_parent = (*x).parent;
                    } else {
                        if color_of((*w).left) == Color::Black {
                            if !(*w).right.is_null() {
                                (*(*w).right).color = Color::Black;
                            }
                            (*w).color = Color::Red;
                            self.rotate_left(w);
                            w = (*x_parent).left;
                        }
                        (*w).color = (*x_parent).color;
                        (*x_parent).color = Color::Black;
                        if !(*w).left.is_null() {
                            (*(*w).left).color = Color::Black;
                        }
                        self.rotate_right(x_parent);
                        x = self.root;
                        x_parent = std::ptr::null_mut();
                    }
                }
            }
            if !x.is_null() {
                (*x).color = Color::Black;
            }
        }
    }

    /// In-order successor, or `None` past the end.
    pub fn increment(&self, handle: NodeHandle<K>) -> Option<NodeHandle<K>> {
        let mut node = handle.0;
        unsafe {
            if !(*node).right.is_null() {
                return Some(NodeHandle(Self::minimum((*node).right)));
            }
            loop {
                let parent = (*node).parent;
                if parent.is_null() {
                    return None;
                }
                if (*parent).left == node {
                    return Some(NodeHandle(parent));
                }
                node = parent;
            }
        }
    }

    /// In-order predecessor, or `None` before the start.
    pub fn decrement(&self, handle: NodeHandle<K>) -> Option<NodeHandle<K>> {
        let mut node = handle.0;
        unsafe {
            if !(*node).left.is_null() {
                return Some(NodeHandle(Self::maximum((*node).left)));
            }
            loop {
                let parent = (*node).parent;
                if parent.is_null() {
                    return None;
                }
                if (*parent).right == node {
                    return Some(NodeHandle(parent));
                }
                node = parent;
            }
        }
    }

    /// In-order iteration, for tests and the hash table's bucket scans.
    pub fn iter(&self) -> RbIter<'_, K> {
        let first = if self.root.is_null() {
            std::ptr::null_mut()
        } else {
            Self::minimum(self.root)
        };
        RbIter {
            tree: self,
            next: first,
        }
    }

    /// Walk the tree checking the four red-black color invariants plus
    /// anchor/leftmost/rightmost consistency (spec §8 seed scenario 5).
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.root.is_null() {
            return Ok(());
        }
        unsafe {
            if (*self.root).color != Color::Black {
                return Err("root is not black".into());
            }
            if !matches!((*self.root).anchor, Anchor::Root) {
                return Err("root anchor is not Root".into());
            }
            let mut black_height = None;
            self.check_node(self.root, 0, &mut black_height)?;
            let reached_leftmost = Self::minimum(self.root);
            if reached_leftmost != self.leftmost {
                return Err("leftmost inconsistent".into());
            }
            let reached_rightmost = Self::maximum(self.root);
            if reached_rightmost != self.rightmost {
                return Err("rightmost inconsistent".into());
            }
        }
        Ok(())
    }

    unsafe fn check_node(&self, node: *mut RbNode<K>, black_count: usize, expected: &mut Option<usize>) -> Result<(), String> {
        if node.is_null() {
            let count = if color_of(node) == Color::Black { black_count + 1 } else { black_count };
            match expected {
                None => *expected = Some(count),
                Some(e) if *e != count => return Err("black-height mismatch".into()),
                _ => {}
            }
            return Ok(());
        }
        let n = &*node;
        if n.color == Color::Red {
            if color_of(n.left) == Color::Red || color_of(n.right) == Color::Red {
                return Err("red node has red child".into());
            }
        }
        let anchor_ok = match n.anchor {
            Anchor::Root => n.parent.is_null(),
            Anchor::Left(p) => p == n.parent && (*p).left == node,
            Anchor::Right(p) => p == n.parent && (*p).right == node,
        };
        if !anchor_ok {
            return Err("anchor does not satisfy *anchor == node".into());
        }
        let next_black = if n.color == Color::Black { black_count + 1 } else { black_count };
        self.check_node(n.left, next_black, expected)?;
        self.check_node(n.right, next_black, expected)?;
        Ok(())
    }
}

impl<K> Drop for RbTree<K> {
    fn drop(&mut self) {
        unsafe fn drop_subtree<K>(node: *mut RbNode<K>) {
            if node.is_null() {
                return;
            }
            unsafe {
                drop_subtree((*node).left);
                drop_subtree((*node).right);
                drop(Box::from_raw(node));
            }
        }
        unsafe { drop_subtree(self.root) };
    }
}

pub struct RbIter<'a, K> {
    tree: &'a RbTree<K>,
    next: *mut RbNode<K>,
}

impl<'a, K> Iterator for RbIter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let current = self.next;
        let handle = NodeHandle(current);
        self.next = self.tree.increment(handle).map(|h| h.0).unwrap_or(std::ptr::null_mut());
        unsafe { Some(&(*current).value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_iteration_and_extremes() {
        let mut tree = RbTree::new(|a: &i64, b: &i64| a.cmp(b));
        for v in [4738, 6483, 8393, 9661, 2990] {
            tree.insert(v);
        }
        let collected: Vec<i64> = tree.iter().copied().collect();
        assert_eq!(collected, vec![2990, 4738, 6483, 8393, 9661]);
        assert_eq!(*tree.leftmost().unwrap(), 2990);
        assert_eq!(*tree.rightmost().unwrap(), 9661);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_keys_preserve_insertion_order() {
        let mut tree = RbTree::new(|a: &(i64, i64), b: &(i64, i64)| a.0.cmp(&b.0));
        tree.insert((1, 100));
        tree.insert((1, 200));
        tree.insert((1, 300));
        let collected: Vec<i64> = tree.iter().map(|(_, v)| *v).collect();
        assert_eq!(collected, vec![100, 200, 300]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn insert_and_unlink_many_preserves_invariants() {
        let mut tree = RbTree::new(|a: &i64, b: &i64| a.cmp(b));
        let values: Vec<i64> = (0..500).map(|i| (i * 37) % 997).collect();
        let mut handles = Vec::new();
        for v in &values {
            handles.push(tree.insert(*v));
            tree.check_invariants().unwrap();
        }
        assert_eq!(tree.len(), 500);
        for (i, h) in handles.into_iter().enumerate() {
            if i % 2 == 0 {
                tree.unlink(h);
                tree.check_invariants().unwrap();
            }
        }
        assert_eq!(tree.len(), 250);
    }
}
