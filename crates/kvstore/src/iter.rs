//! Prefix iteration over the RAM index, with a bounded handle pool.

use blockdev::BlockDevice;

use crate::{IterHandle, IterState, KvStore, Result, StoreError};

impl<D: BlockDevice> KvStore<D> {
    /// Opens an iterator over keys starting with `prefix` (all keys when
    /// `None`), walking the index in hash order.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfResources`] when all
    /// [`MAX_OPEN_ITERATORS`](crate::MAX_OPEN_ITERATORS) slots are taken.
    pub fn iter_open(&mut self, prefix: Option<&str>) -> Result<IterHandle> {
        let slot = self
            .iters
            .iter()
            .position(Option::is_none)
            .ok_or(StoreError::OutOfResources)?;
        self.iters[slot] = Some(IterState {
            pos: 0,
            prefix: prefix.map(str::to_owned),
        });
        Ok(IterHandle { slot })
    }

    /// Returns the next matching key. [`StoreError::NotFound`] when the
    /// iteration is exhausted.
    ///
    /// Keys inserted or removed while the iterator is open shift its cursor
    /// along with the index, so nothing already passed is repeated and
    /// nothing not yet passed is skipped. This is best-effort consistency,
    /// not a snapshot: a key inserted at a position the cursor has already
    /// moved beyond is not observed.
    pub fn iter_next(&mut self, handle: &IterHandle) -> Result<String> {
        let prefix = match self.iters.get(handle.slot).and_then(Option::as_ref) {
            Some(state) => state.prefix.clone(),
            None => return Err(StoreError::InvalidArgument),
        };
        loop {
            let pos = match self.iters[handle.slot].as_ref() {
                Some(state) => state.pos,
                None => return Err(StoreError::InvalidArgument),
            };
            let Some(entry) = self.index.get(pos) else {
                return Err(StoreError::NotFound);
            };
            // advance past the entry before decoding it, so a corrupt record
            // cannot wedge the cursor
            if let Some(state) = self.iters[handle.slot].as_mut() {
                state.pos = pos + 1;
            }

            let active = self.active;
            let Some(rec) = self.read_header(active, u64::from(entry.offset))? else {
                return Err(StoreError::CorruptData);
            };
            let key = self.read_key(active, rec)?;
            let key = String::from_utf8(key).map_err(|_| StoreError::CorruptData)?;
            let matches = match &prefix {
                Some(p) => key.starts_with(p.as_str()),
                None => true,
            };
            if matches {
                return Ok(key);
            }
        }
    }

    /// Releases the iterator's pool slot.
    pub fn iter_close(&mut self, handle: IterHandle) -> Result<()> {
        let Some(slot) = self.iters.get_mut(handle.slot) else {
            return Err(StoreError::InvalidArgument);
        };
        if slot.take().is_none() {
            return Err(StoreError::InvalidArgument);
        }
        Ok(())
    }

    // ---- cursor maintenance, called by the write path ----

    /// An index insertion at `pos` shifted every later entry one slot up;
    /// cursors already past that point follow.
    pub(crate) fn cursor_inserted(&mut self, pos: usize) {
        for state in self.iters.iter_mut().flatten() {
            if state.pos > pos {
                state.pos += 1;
            }
        }
    }

    /// An index removal at `pos` shifted every later entry one slot down;
    /// cursors already past that point follow.
    pub(crate) fn cursor_removed(&mut self, pos: usize) {
        for state in self.iters.iter_mut().flatten() {
            if state.pos > pos {
                state.pos -= 1;
            }
        }
    }
}
