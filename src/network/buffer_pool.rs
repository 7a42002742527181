// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use memmap2::MmapMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{AppError, AppResult};

/// Recycled heap buffers kept per pool.
const MAX_FREE_BUFFERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// Ordinary allocator memory, recycled through a free list.
    #[default]
    Heap,
    /// Anonymous memory maps outside the allocator heap, unmapped on release.
    Direct,
}

#[derive(Debug, Default)]
struct PoolState {
    outstanding: usize,
    free: Vec<BytesMut>,
}

/// Read buffers shared by every connection of a factory.
///
/// `capacity` bounds the bytes checked out at once. Releasing a buffer
/// consumes its handle, and dropping a handle releases it too, so a buffer
/// can be neither released twice nor used after release.
#[derive(Debug, Clone)]
pub struct BufferPool {
    mode: BufferMode,
    capacity: usize,
    state: Arc<Mutex<PoolState>>,
}

impl BufferPool {
    pub fn new(mode: BufferMode, capacity: usize) -> Self {
        BufferPool {
            mode,
            capacity,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Returns a zero-filled buffer of exactly `size` bytes.
    pub fn acquire(&self, size: usize) -> AppResult<PooledBuffer> {
        if size == 0 {
            return Err(AppError::InvalidValue(
                "buffer size must be positive".to_string(),
            ));
        }
        let recycled = {
            let mut state = self.state.lock();
            let available = self.capacity.saturating_sub(state.outstanding);
            if size > available {
                return Err(AppError::BufferExhausted {
                    requested: size,
                    available,
                });
            }
            state.outstanding += size;
            match self.mode {
                BufferMode::Heap => state
                    .free
                    .iter()
                    .position(|buffer| buffer.capacity() >= size)
                    .map(|index| state.free.swap_remove(index)),
                BufferMode::Direct => None,
            }
        };

        let storage = match self.mode {
            BufferMode::Heap => {
                let mut buffer = recycled.unwrap_or_default();
                buffer.resize(size, 0);
                Storage::Heap(buffer)
            }
            // mapping happens outside the lock
            BufferMode::Direct => match MmapMut::map_anon(size) {
                Ok(map) => Storage::Direct(map),
                Err(err) => {
                    self.state.lock().outstanding -= size;
                    return Err(err.into());
                }
            },
        };
        trace!(size, mode = ?self.mode, "buffer acquired");
        Ok(PooledBuffer {
            storage: Some(storage),
            size,
            state: self.state.clone(),
        })
    }

    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }
}

enum Storage {
    Heap(BytesMut),
    Direct(MmapMut),
}

/// A buffer checked out of a [`BufferPool`]; dereferences to its bytes.
pub struct PooledBuffer {
    storage: Option<Storage>,
    size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl PooledBuffer {
    pub fn is_direct(&self) -> bool {
        matches!(self.storage, Some(Storage::Direct(_)))
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Some(Storage::Heap(buffer)) => buffer,
            Some(Storage::Direct(map)) => map,
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(Storage::Heap(buffer)) => buffer,
            Some(Storage::Direct(map)) => map,
            None => &mut [],
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("size", &self.size)
            .field("direct", &self.is_direct())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.outstanding -= self.size;
        match self.storage.take() {
            Some(Storage::Heap(mut buffer)) => {
                if state.free.len() < MAX_FREE_BUFFERS {
                    buffer.clear();
                    state.free.push(buffer);
                }
            }
            // unmapped here
            Some(Storage::Direct(map)) => drop(map),
            None => {}
        }
    }
}
