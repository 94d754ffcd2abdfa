//! # Ring buffer transport
//!
//! Single-producer / single-consumer queue of `u32` words over a
//! memory-mapped file, the only shared memory between workers. Each side
//! runs a two-phase cursor protocol: the producer advances `prod_head` to
//! reserve room, copies the message, then advances `prod_tail` to publish
//! it; the consumer mirrors this with `cons_head` / `cons_tail`. Readers
//! never observe a message before its `prod_tail` advance, so a writer
//! crashing mid-copy leaks words without corrupting anything.
//!
//! All four cursors are word indices modulo `nb_words`. One word is kept in
//! reserve to tell a full ring from an empty one, so usable capacity is
//! `nb_words - 1`. Messages are framed as `[len, payload...]`.
//!
//! Layout, little-endian u32 words:
//!
//! ```text
//! magic, version, nb_words, prod_head, prod_tail, cons_head, cons_tail, crc
//! data[nb_words]
//! ```

use crate::error::{Result, WeirError};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const MAGIC: u32 = 0x5745_4952; // "WEIR"
const VERSION: u32 = 1;
const HEADER_WORDS: usize = 8;

const W_MAGIC: usize = 0;
const W_VERSION: usize = 1;
const W_NB_WORDS: usize = 2;
const W_PROD_HEAD: usize = 3;
const W_PROD_TAIL: usize = 4;
const W_CONS_HEAD: usize = 5;
const W_CONS_TAIL: usize = 6;
const W_CRC: usize = 7;

/// A reservation returned by [`RingBuf::enqueue_alloc`], committed by
/// [`RingBuf::enqueue_commit`].
#[derive(Debug, Clone, Copy)]
pub struct Tx {
    start: u32,
    words: u32,
}

/// Memory-mapped SPSC ring buffer.
pub struct RingBuf {
    mmap: MmapMut,
    nb_words: u32,
    path: PathBuf,
}

impl RingBuf {
    /// Create a fresh ring buffer file, replacing any stale one at the path.
    pub fn create(path: &Path, nb_words: u32) -> Result<RingBuf> {
        if nb_words < 2 {
            return Err(WeirError::invalid("ring buffer needs at least 2 words"));
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let size = (HEADER_WORDS + nb_words as usize) * 4;
        file.set_len(size as u64)?;
        // Safety: the file was just created with the right length and is
        // only shared through the cursor protocol below.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let ring = RingBuf {
            mmap,
            nb_words,
            path: path.to_path_buf(),
        };
        ring.word(W_MAGIC).store(MAGIC, Ordering::Relaxed);
        ring.word(W_VERSION).store(VERSION, Ordering::Relaxed);
        ring.word(W_NB_WORDS).store(nb_words, Ordering::Relaxed);
        ring.word(W_PROD_HEAD).store(0, Ordering::Relaxed);
        ring.word(W_PROD_TAIL).store(0, Ordering::Relaxed);
        ring.word(W_CONS_HEAD).store(0, Ordering::Relaxed);
        ring.word(W_CONS_TAIL).store(0, Ordering::Relaxed);
        ring.word(W_CRC).store(header_crc(nb_words), Ordering::Release);
        Ok(ring)
    }

    /// Map an existing ring buffer file, re-validating its header.
    pub fn open(path: &Path) -> Result<RingBuf> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < (HEADER_WORDS * 4) as u64 {
            return Err(WeirError::fatal(format!(
                "ring buffer {} too short",
                path.display()
            )));
        }
        // Safety: length checked; all accesses go through atomic words.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let probe = RingBuf {
            mmap,
            nb_words: 0,
            path: path.to_path_buf(),
        };
        let magic = probe.word(W_MAGIC).load(Ordering::Relaxed);
        let version = probe.word(W_VERSION).load(Ordering::Relaxed);
        let nb_words = probe.word(W_NB_WORDS).load(Ordering::Relaxed);
        let crc = probe.word(W_CRC).load(Ordering::Relaxed);
        if magic != MAGIC || version != VERSION {
            return Err(WeirError::fatal(format!(
                "{} is not a ring buffer",
                path.display()
            )));
        }
        if crc != header_crc(nb_words) {
            return Err(WeirError::fatal(format!(
                "ring buffer {} header checksum mismatch",
                path.display()
            )));
        }
        if len != ((HEADER_WORDS + nb_words as usize) * 4) as u64 {
            return Err(WeirError::fatal(format!(
                "ring buffer {} size does not match its header",
                path.display()
            )));
        }
        let ring = RingBuf { nb_words, ..probe };
        for w in [W_PROD_HEAD, W_PROD_TAIL, W_CONS_HEAD, W_CONS_TAIL] {
            if ring.word(w).load(Ordering::Relaxed) >= nb_words {
                return Err(WeirError::fatal(format!(
                    "ring buffer {} cursor out of range",
                    path.display()
                )));
            }
        }
        Ok(ring)
    }

    /// Producer-side crash recovery: drop any reservation that was never
    /// committed. Only the (single) producer may call this, before writing.
    pub fn producer_recover(&self) {
        let tail = self.word(W_PROD_TAIL).load(Ordering::Acquire);
        self.word(W_PROD_HEAD).store(tail, Ordering::Release);
    }

    /// Consumer-side crash recovery, symmetric to [`Self::producer_recover`].
    pub fn consumer_recover(&self) {
        let tail = self.word(W_CONS_TAIL).load(Ordering::Acquire);
        self.word(W_CONS_HEAD).store(tail, Ordering::Release);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nb_words(&self) -> u32 {
        self.nb_words
    }

    /// Largest message payload (in words) that can ever fit.
    pub fn capacity_words(&self) -> u32 {
        // one word of framing, one word kept in reserve
        self.nb_words - 2
    }

    /// Words currently committed and not yet consumed.
    pub fn used_words(&self) -> u32 {
        let head = self.word(W_PROD_TAIL).load(Ordering::Acquire);
        let tail = self.word(W_CONS_TAIL).load(Ordering::Acquire);
        self.sub(head, tail)
    }

    fn word(&self, idx: usize) -> &AtomicU32 {
        // Safety: idx is always < HEADER_WORDS + nb_words, the mapping is
        // word-aligned, and every shared access goes through this atomic.
        unsafe {
            let base = self.mmap.as_ptr().cast::<AtomicU32>();
            &*base.add(idx)
        }
    }

    fn data(&self, idx: u32) -> &AtomicU32 {
        self.word(HEADER_WORDS + (idx % self.nb_words) as usize)
    }

    fn add(&self, a: u32, n: u32) -> u32 {
        (a + n) % self.nb_words
    }

    fn sub(&self, a: u32, b: u32) -> u32 {
        (a + self.nb_words - b) % self.nb_words
    }

    /// Reserve room for a payload of `len` words. Fails with `NoSpace` when
    /// the ring is too full right now (backpressure) and `TooBig` when the
    /// message can never fit.
    pub fn enqueue_alloc(&self, len: u32) -> Result<Tx> {
        let total = len + 1; // len word + payload
        if total > self.nb_words - 1 {
            return Err(WeirError::TooBig {
                words: len as usize,
                capacity: self.capacity_words() as usize,
            });
        }
        let head = self.word(W_PROD_HEAD).load(Ordering::Relaxed);
        let cons_tail = self.word(W_CONS_TAIL).load(Ordering::Acquire);
        let used = self.sub(head, cons_tail);
        let free = self.nb_words - 1 - used;
        if total > free {
            return Err(WeirError::NoSpace);
        }
        self.word(W_PROD_HEAD)
            .store(self.add(head, total), Ordering::Release);
        Ok(Tx {
            start: head,
            words: total,
        })
    }

    /// Copy the payload into the reservation and publish it.
    pub fn enqueue_commit(&self, tx: Tx, payload: &[u32]) -> Result<()> {
        if payload.len() as u32 + 1 != tx.words {
            return Err(WeirError::fatal("commit does not match its reservation"));
        }
        let tail = self.word(W_PROD_TAIL).load(Ordering::Relaxed);
        if tail != tx.start {
            // a previous reservation was never committed
            return Err(WeirError::fatal("ring buffer commit out of order"));
        }
        self.data(tx.start).store(payload.len() as u32, Ordering::Relaxed);
        for (i, w) in payload.iter().enumerate() {
            self.data(self.add(tx.start, 1 + i as u32))
                .store(*w, Ordering::Relaxed);
        }
        self.word(W_PROD_TAIL)
            .store(self.add(tx.start, tx.words), Ordering::Release);
        Ok(())
    }

    /// Reserve then commit in one go.
    pub fn enqueue(&self, payload: &[u32]) -> Result<()> {
        let tx = self.enqueue_alloc(payload.len() as u32)?;
        self.enqueue_commit(tx, payload)
    }

    /// Pop the next message, or `None` when the ring is empty.
    pub fn dequeue(&self) -> Result<Option<Vec<u32>>> {
        let head = self.word(W_CONS_HEAD).load(Ordering::Relaxed);
        let prod_tail = self.word(W_PROD_TAIL).load(Ordering::Acquire);
        if head == prod_tail {
            return Ok(None);
        }
        let available = self.sub(prod_tail, head);
        let len = self.data(head).load(Ordering::Relaxed);
        if len + 1 > available {
            return Err(WeirError::fatal("ring buffer message overruns its data"));
        }
        self.word(W_CONS_HEAD)
            .store(self.add(head, len + 1), Ordering::Release);
        let mut payload = Vec::with_capacity(len as usize);
        for i in 0..len {
            payload.push(self.data(self.add(head, 1 + i)).load(Ordering::Relaxed));
        }
        self.word(W_CONS_TAIL)
            .store(self.add(head, len + 1), Ordering::Release);
        Ok(Some(payload))
    }

    /// Unmap and delete the backing file.
    pub fn unlink(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn header_crc(nb_words: u32) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&MAGIC.to_le_bytes());
    h.update(&VERSION.to_le_bytes());
    h.update(&nb_words.to_le_bytes());
    h.finalize()
}
