use std::sync::Arc;

use crate::error::StoreError;
use crate::mvmap::MvMap;
use crate::page::{Page, PageContent};

/// Snapshot cursor over a map.
///
/// The cursor binds to a root page at construction time; writers that run
/// concurrently swap in new roots and never invalidate it. Forward cursors
/// start at the smallest key `>= from`, reverse cursors at the largest key
/// `<= from`.
pub struct Cursor<'a, K, V> {
    map: &'a MvMap<K, V>,
    /// Descent stack: page plus the index of the next entry (or child) to
    /// visit within it.
    stack: Vec<(Arc<Page<K, V>>, usize)>,
    reverse: bool,
}

impl<'a, K, V> Cursor<'a, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        map: &'a MvMap<K, V>,
        root: Arc<Page<K, V>>,
        from: Option<&K>,
        reverse: bool,
    ) -> Result<Self, StoreError> {
        let mut cursor = Cursor {
            map,
            stack: Vec::new(),
            reverse,
        };
        cursor.descend(root, from)?;
        Ok(cursor)
    }

    fn descend(&mut self, mut page: Arc<Page<K, V>>, from: Option<&K>) -> Result<(), StoreError> {
        let key_type = self.map.key_type().clone();
        let compare = |a: &K, b: &K| key_type.compare(a, b);
        loop {
            match &page.content {
                PageContent::Leaf(_) => {
                    let index = match from {
                        None if self.reverse => page.key_count().wrapping_sub(1),
                        None => 0,
                        Some(key) => match page.search(key, &compare) {
                            Ok(i) => i,
                            // Insertion point: forward starts there, reverse
                            // starts one before it.
                            Err(i) if self.reverse => i.wrapping_sub(1),
                            Err(i) => i,
                        },
                    };
                    self.stack.push((page, index));
                    return Ok(());
                }
                PageContent::Node(children) => {
                    let index = match from {
                        None if self.reverse => children.len() - 1,
                        None => 0,
                        Some(key) => page.child_index(key, &compare),
                    };
                    let child = self.map.resolve(&children[index])?;
                    self.stack.push((page, index));
                    page = child;
                }
            }
        }
    }

    /// Advance and return the next entry, or `None` when exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, StoreError> {
        loop {
            let Some((page, index)) = self.stack.last().cloned() else {
                return Ok(None);
            };
            match &page.content {
                PageContent::Leaf(values) => {
                    // wrapping_sub marks "before the first entry" for
                    // reverse cursors.
                    if index < page.key_count() {
                        let entry = (page.keys[index].clone(), values[index].clone());
                        let top = self.stack.last_mut().unwrap();
                        if self.reverse {
                            top.1 = index.wrapping_sub(1);
                        } else {
                            top.1 = index + 1;
                        }
                        return Ok(Some(entry));
                    }
                    self.stack.pop();
                    self.step_up()?;
                }
                PageContent::Node(_) => {
                    // An internal page on top of the stack means we just
                    // exhausted one of its children.
                    self.stack.pop();
                    self.stack.push((page, index));
                    self.step_up()?;
                }
            }
        }
    }

    /// After exhausting the current child, move the parent to its next
    /// child and descend down that edge.
    fn step_up(&mut self) -> Result<(), StoreError> {
        while let Some((page, index)) = self.stack.pop() {
            let PageContent::Node(children) = &page.content else {
                continue;
            };
            let next = if self.reverse {
                index.wrapping_sub(1)
            } else {
                index + 1
            };
            if next < children.len() {
                let child = self.map.resolve(&children[next])?;
                self.stack.push((page, next));
                self.descend_edge(child)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Descend to the first (or last, for reverse) entry under `page`.
    fn descend_edge(&mut self, mut page: Arc<Page<K, V>>) -> Result<(), StoreError> {
        loop {
            match &page.content {
                PageContent::Leaf(_) => {
                    let index = if self.reverse {
                        page.key_count().wrapping_sub(1)
                    } else {
                        0
                    };
                    self.stack.push((page, index));
                    return Ok(());
                }
                PageContent::Node(children) => {
                    let index = if self.reverse { children.len() - 1 } else { 0 };
                    let child = self.map.resolve(&children[index])?;
                    self.stack.push((page, index));
                    page = child;
                }
            }
        }
    }
}

impl<K, V> Iterator for Cursor<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = Result<(K, V), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
