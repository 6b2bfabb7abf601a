//! Pooled buffers. Copy loops and scatter-gather payloads draw
//! fixed-size slabs from per-size freelists instead of allocating; every
//! xaction returns its buffers at finalize, so steady-state workloads
//! run allocation-free.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// The slab sizes served by a Pool, smallest first.
pub const SLAB_SIZES: [usize; 3] = [32 * 1024, 128 * 1024, 1024 * 1024];

/// Pool hands out Slabs and SGLs. Cheap to clone; all clones share the
/// same freelists.
#[derive(Clone, Default)]
pub struct Pool {
    free: Arc<[Mutex<Vec<Box<[u8]>>>; 3]>,
}

/// Slab is one pooled buffer; returned to its freelist on drop.
pub struct Slab {
    buf: Option<Box<[u8]>>,
    class: usize,
    pool: Pool,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_of(size_hint: usize) -> usize {
        SLAB_SIZES
            .iter()
            .position(|&s| size_hint <= s)
            .unwrap_or(SLAB_SIZES.len() - 1)
    }

    /// A slab large enough for `size_hint` (or the largest class).
    pub fn alloc(&self, size_hint: usize) -> Slab {
        let class = Self::class_of(size_hint);
        let buf = self.free[class]
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; SLAB_SIZES[class]].into_boxed_slice());
        Slab {
            buf: Some(buf),
            class,
            pool: self.clone(),
        }
    }

    /// A scatter-gather list that grows by slabs of `size_hint` class.
    pub fn sgl(&self, size_hint: usize) -> Sgl {
        Sgl {
            pool: self.clone(),
            class_hint: size_hint,
            slabs: Vec::new(),
            len: 0,
            roff: 0,
        }
    }

    fn put_back(&self, class: usize, buf: Box<[u8]>) {
        let mut free = self.free[class].lock().unwrap();
        // Bound the freelist; beyond it, let the allocator have it back.
        if free.len() < 128 {
            free.push(buf);
        }
    }

    /// Number of pooled (idle) buffers, per class. Test/stats hook.
    pub fn idle_counts(&self) -> [usize; 3] {
        [
            self.free[0].lock().unwrap().len(),
            self.free[1].lock().unwrap().len(),
            self.free[2].lock().unwrap().len(),
        ]
    }
}

impl Slab {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
    pub fn len(&self) -> usize {
        SLAB_SIZES[self.class]
    }
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(self.class, buf);
        }
    }
}

/// Copy `src` to `dst` through one pooled slab; returns bytes copied.
pub fn copy_buf<R: Read, W: Write>(pool: &Pool, src: &mut R, dst: &mut W, size_hint: usize) -> std::io::Result<u64> {
    let mut slab = pool.alloc(size_hint);
    let buf = slab.as_mut_slice();
    let mut total = 0u64;
    loop {
        let n = src.read(buf)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Sgl is a growable chain of pooled slabs with Write-then-Read
/// semantics: fill it, then drain it from the front.
pub struct Sgl {
    pool: Pool,
    class_hint: usize,
    slabs: Vec<Slab>,
    len: usize,
    roff: usize,
}

impl Sgl {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop all content and return every slab to the pool.
    pub fn free(&mut self) {
        self.slabs.clear();
        self.len = 0;
        self.roff = 0;
    }
}

impl Write for Sgl {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let cap = self.slabs.last().map(|s| s.len()).unwrap_or(0);
            let used_in_last = if self.slabs.is_empty() {
                0
            } else {
                // Bytes already written into the final slab.
                let full: usize = self.slabs[..self.slabs.len() - 1].iter().map(|s| s.len()).sum();
                self.len - full
            };
            if self.slabs.is_empty() || used_in_last == cap {
                let slab = self.pool.alloc(self.class_hint);
                self.slabs.push(slab);
                continue;
            }
            let slab = self.slabs.last_mut().unwrap();
            let n = (slab.len() - used_in_last).min(data.len() - written);
            slab.as_mut_slice()[used_in_last..used_in_last + n]
                .copy_from_slice(&data[written..written + n]);
            written += n;
            self.len += n;
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for Sgl {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.roff >= self.len || out.is_empty() {
            return Ok(0);
        }
        let mut produced = 0;
        while produced < out.len() && self.roff < self.len {
            // Locate the slab holding roff.
            let mut off = self.roff;
            let mut idx = 0;
            while off >= self.slabs[idx].len() {
                off -= self.slabs[idx].len();
                idx += 1;
            }
            let slab_used = if idx == self.slabs.len() - 1 {
                let full: usize = self.slabs[..idx].iter().map(|s| s.len()).sum();
                self.len - full
            } else {
                self.slabs[idx].len()
            };
            let avail = slab_used - off;
            let n = avail.min(out.len() - produced);
            out[produced..produced + n]
                .copy_from_slice(&self.slabs[idx].as_mut_slice()[off..off + n]);
            produced += n;
            self.roff += n;
        }
        Ok(produced)
    }
}

impl Drop for Sgl {
    fn drop(&mut self) {
        self.free();
    }
}
