// Free-list over a dense integer range
//
// Hands out integers `0..capacity` and takes them back, growing the
// backing range on demand. Used wherever a subsystem needs a stable,
// densely packed handle space (BLAS table slots, resource graph slots)
// without wanting to roll its own free-list bookkeeping.
//
// Austin Shafer - 2024
const DEFAULT_CAPACITY: i32 = 256;

pub struct IntPool {
    free_list: Vec<i32>,
    capacity: i32,
    free: i32,
}

impl IntPool {
    pub fn new() -> Self {
        Self {
            free_list: Vec::new(),
            capacity: 0,
            free: 0,
        }
    }

    fn grow(&mut self, new_capacity: i32) {
        debug_assert!(new_capacity > self.capacity);
        let new_items = new_capacity - self.capacity;

        let mut new_free_list = Vec::with_capacity(new_capacity as usize);
        new_free_list.extend_from_slice(&self.free_list[..self.free as usize]);
        for i in 0..new_items {
            new_free_list.push(new_capacity - i - 1);
        }
        // preserve the allocated tail (not part of the free region) so that
        // clear() can still find it
        new_free_list.extend_from_slice(&self.free_list[self.free as usize..self.capacity as usize]);

        self.free_list = new_free_list;
        self.free += new_items;
        self.capacity = new_capacity;
    }

    /// Allocate the next free integer, growing the pool if necessary.
    pub fn alloc(&mut self) -> i32 {
        if self.free == 0 {
            let new_capacity = if self.capacity == 0 {
                DEFAULT_CAPACITY
            } else {
                self.capacity * 3 / 2
            };
            self.grow(new_capacity);
        }

        self.free -= 1;
        self.free_list[self.free as usize]
    }

    /// Return `val` to the pool. `val` must have come from `alloc()` on
    /// this pool and not already be free.
    pub fn free(&mut self, val: i32) {
        debug_assert!(self.free < self.capacity);
        debug_assert!(val >= 0 && val < self.capacity);

        for i in self.free as usize..self.capacity as usize {
            if self.free_list[i] != val {
                continue;
            }

            self.free_list.swap(self.free as usize, i);
            self.free += 1;
            return;
        }

        debug_assert!(false, "IntPool::free: item not found in allocated tail");
    }

    /// Marks every integer handed out so far as free again.
    pub fn clear(&mut self) {
        self.free = self.capacity;
    }

    pub fn capacity(&self) -> i32 {
        self.capacity
    }
}

impl Default for IntPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_grows_from_empty() {
        let mut pool = IntPool::new();
        let a = pool.alloc();
        let b = pool.alloc();
        assert_ne!(a, b);
        assert!(pool.capacity() >= 2);
    }

    #[test]
    fn free_and_realloc_reuses_value() {
        let mut pool = IntPool::new();
        let a = pool.alloc();
        let _b = pool.alloc();
        pool.free(a);
        let c = pool.alloc();
        assert_eq!(a, c);
    }

    #[test]
    fn clear_recycles_everything() {
        let mut pool = IntPool::new();
        let mut handed_out = Vec::new();
        for _ in 0..10 {
            handed_out.push(pool.alloc());
        }
        pool.clear();
        // the full capacity should be allocatable again without growing
        let cap = pool.capacity();
        for _ in 0..cap {
            pool.alloc();
        }
    }
}
