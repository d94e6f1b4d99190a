//! Memory-mapped single-producer / single-consumer ring buffer.
//!
//! The file layout is a six-word little-endian header followed by
//! `nb_words` data words:
//!
//! ```text
//! header: { nb_words, prod_head, prod_tail, cons_head, cons_tail, mmap_size }
//! data:   u32[nb_words]          // circular
//! ```
//!
//! All four cursors are word indices modulo `nb_words`. Each side runs a
//! two-phase protocol: *alloc* reserves words by advancing its head,
//! *commit* publishes them by advancing its tail. A reader never looks
//! past `prod_tail`, so a producer killed between the two phases leaks
//! the reserved words but never exposes a partially written message.
//! One word of capacity is sacrificed to tell a full buffer from an
//! empty one.
//!
//! Invariant: `cons_tail ≤ cons_head ≤ prod_tail ≤ prod_head` (modulo
//! `nb_words`).

use crate::error::Error;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const HEADER_WORDS: usize = 6;
const NB_WORDS: usize = 0;
const PROD_HEAD: usize = 1;
const PROD_TAIL: usize = 2;
const CONS_HEAD: usize = 3;
const CONS_TAIL: usize = 4;
const MMAP_SIZE: usize = 5;

/// A transaction descriptor: words reserved by an alloc, waiting for the
/// matching commit.
#[derive(Debug, Clone, Copy)]
pub struct Tx {
    seq: u32,
    nb_words: u32,
}

pub struct RingBuf {
    map: MmapMut,
    path: PathBuf,
    nb_words: u32,
}

impl std::fmt::Debug for RingBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuf")
            .field("path", &self.path)
            .field("nb_words", &self.nb_words)
            .finish()
    }
}

impl RingBuf {
    /// Create a fresh ring buffer file, unlinking any leftover with the
    /// same name first (crash recovery).
    pub fn create(path: &Path, nb_words: u32) -> Result<RingBuf, Error> {
        if nb_words < 2 {
            return Err(Error::fatal("a ring buffer needs at least 2 words"));
        }
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("unlinked leftover ring buffer {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("unlinking {}", path.display()), e)),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
        let size = (HEADER_WORDS + nb_words as usize) * 4;
        file.set_len(size as u64)
            .map_err(|e| Error::io(format!("sizing {}", path.display()), e))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::io(format!("mapping {}", path.display()), e))?;
        let rb = RingBuf {
            map,
            path: path.to_path_buf(),
            nb_words,
        };
        rb.header(NB_WORDS).store(nb_words, Ordering::Relaxed);
        rb.header(PROD_HEAD).store(0, Ordering::Relaxed);
        rb.header(PROD_TAIL).store(0, Ordering::Relaxed);
        rb.header(CONS_HEAD).store(0, Ordering::Relaxed);
        rb.header(CONS_TAIL).store(0, Ordering::Relaxed);
        rb.header(MMAP_SIZE).store(size as u32, Ordering::Release);
        Ok(rb)
    }

    /// Map an existing ring buffer, re-validating its header: the file
    /// size must match `nb_words` and every cursor must be in range.
    pub fn load(path: &Path) -> Result<RingBuf, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?
            .len() as usize;
        if size <= HEADER_WORDS * 4 {
            return Err(Error::fatal(format!(
                "ring buffer {} is too small ({size} bytes)",
                path.display()
            )));
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::io(format!("mapping {}", path.display()), e))?;
        let rb = RingBuf {
            map,
            path: path.to_path_buf(),
            nb_words: 0,
        };
        let nb_words = rb.header(NB_WORDS).load(Ordering::Acquire);
        if (HEADER_WORDS + nb_words as usize) * 4 != size {
            return Err(Error::fatal(format!(
                "ring buffer {}: file size {size} does not match {nb_words} words",
                path.display()
            )));
        }
        for (what, idx) in [
            ("prod head", PROD_HEAD),
            ("prod tail", PROD_TAIL),
            ("cons head", CONS_HEAD),
            ("cons tail", CONS_TAIL),
        ] {
            let v = rb.header(idx).load(Ordering::Relaxed);
            if v >= nb_words {
                return Err(Error::fatal(format!(
                    "ring buffer {}: {what} ({v}) out of range (< {nb_words})",
                    path.display()
                )));
            }
        }
        rb.header(MMAP_SIZE).store(size as u32, Ordering::Relaxed);
        Ok(RingBuf { nb_words, ..rb })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nb_words(&self) -> u32 {
        self.nb_words
    }

    /// Remove the backing file. The mapping stays valid until drop.
    pub fn unlink(&self) -> Result<(), Error> {
        std::fs::remove_file(&self.path)
            .map_err(|e| Error::io(format!("unlinking {}", self.path.display()), e))
    }

    fn header(&self, idx: usize) -> &AtomicU32 {
        debug_assert!(idx < HEADER_WORDS);
        // The mapping is page-aligned and lives as long as self.
        unsafe { &*(self.map.as_ptr().add(idx * 4) as *const AtomicU32) }
    }

    fn read_data(&self, idx: u32) -> u32 {
        let at = (idx % self.nb_words) as usize;
        unsafe {
            (self.map.as_ptr().add((HEADER_WORDS + at) * 4) as *const u32).read_volatile()
        }
    }

    fn write_data(&self, idx: u32, v: u32) {
        let at = (idx % self.nb_words) as usize;
        unsafe {
            (self.map.as_ptr().add((HEADER_WORDS + at) * 4) as *mut u32).write_volatile(v)
        }
    }

    /// Words ready for the consumer.
    pub fn nb_entries(&self) -> u32 {
        let pt = self.header(PROD_TAIL).load(Ordering::Acquire);
        let ch = self.header(CONS_HEAD).load(Ordering::Relaxed);
        (pt + self.nb_words - ch) % self.nb_words
    }

    /// Words still free for the producer.
    pub fn nb_free(&self) -> u32 {
        let ct = self.header(CONS_TAIL).load(Ordering::Acquire);
        let ph = self.header(PROD_HEAD).load(Ordering::Relaxed);
        (ct + self.nb_words - ph - 1) % self.nb_words
    }

    // ---- producer side ----------------------------------------------

    /// Reserve room for a message of `nb_words` payload words. Fails
    /// with `NoSpace` under backpressure and `MessageTooBig` when the
    /// message can never fit.
    pub fn enqueue_alloc(&self, nb_words: u32) -> Result<Tx, Error> {
        let total = nb_words + 1; // length prefix
        if total > self.nb_words - 1 {
            return Err(Error::MessageTooBig {
                nb_words: total,
                capacity: self.nb_words - 1,
            });
        }
        if self.nb_free() < total {
            return Err(Error::NoSpace);
        }
        let seq = self.header(PROD_HEAD).load(Ordering::Relaxed);
        self.header(PROD_HEAD)
            .store((seq + total) % self.nb_words, Ordering::Relaxed);
        Ok(Tx { seq, nb_words })
    }

    /// Copy the message into the reserved words, then publish it.
    pub fn enqueue_commit(&self, tx: &Tx, data: &[u32]) {
        debug_assert_eq!(data.len() as u32, tx.nb_words);
        self.write_data(tx.seq, tx.nb_words);
        for (i, w) in data.iter().enumerate() {
            self.write_data(tx.seq + 1 + i as u32, *w);
        }
        // Readers observe the message only after this store.
        self.header(PROD_TAIL)
            .store((tx.seq + 1 + tx.nb_words) % self.nb_words, Ordering::Release);
    }

    pub fn enqueue(&self, data: &[u32]) -> Result<(), Error> {
        let tx = self.enqueue_alloc(data.len() as u32)?;
        self.enqueue_commit(&tx, data);
        Ok(())
    }

    // ---- consumer side ----------------------------------------------

    /// Claim the next message, if any. The words are copied out; the
    /// matching `dequeue_commit` releases them to the producer.
    pub fn dequeue_alloc(&self) -> Result<Option<(Tx, Vec<u32>)>, Error> {
        let ch = self.header(CONS_HEAD).load(Ordering::Relaxed);
        let pt = self.header(PROD_TAIL).load(Ordering::Acquire);
        if ch == pt {
            return Ok(None);
        }
        let len = self.read_data(ch);
        let available = (pt + self.nb_words - ch) % self.nb_words;
        if len > self.nb_words - 1 || len >= available {
            return Err(Error::fatal(format!(
                "ring buffer {}: corrupted message length {len}",
                self.path.display()
            )));
        }
        let mut data = Vec::with_capacity(len as usize);
        for i in 0..len {
            data.push(self.read_data(ch + 1 + i));
        }
        self.header(CONS_HEAD)
            .store((ch + 1 + len) % self.nb_words, Ordering::Relaxed);
        Ok(Some((
            Tx {
                seq: ch,
                nb_words: len,
            },
            data,
        )))
    }

    pub fn dequeue_commit(&self, tx: &Tx) {
        self.header(CONS_TAIL)
            .store((tx.seq + 1 + tx.nb_words) % self.nb_words, Ordering::Release);
    }

    pub fn dequeue(&self) -> Result<Option<Vec<u32>>, Error> {
        match self.dequeue_alloc()? {
            None => Ok(None),
            Some((tx, data)) => {
                self.dequeue_commit(&tx);
                Ok(Some(data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tmp(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("sluice-ringbuf-tests");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn fifo_round_trip() {
        let rb = RingBuf::create(&tmp("fifo.rb"), 64).unwrap();
        for i in 0..10u32 {
            rb.enqueue(&[i, i * 2, i * 3]).unwrap();
        }
        for i in 0..10u32 {
            assert_eq!(rb.dequeue().unwrap().unwrap(), vec![i, i * 2, i * 3]);
        }
        assert_eq!(rb.dequeue().unwrap(), None);
    }

    #[test]
    fn too_big_fails_permanently_and_exact_fill_recovers() {
        let rb = RingBuf::create(&tmp("fill.rb"), 16).unwrap();
        // 15 usable words: a 15-word payload needs 16.
        match rb.enqueue(&[0; 15]) {
            Err(Error::MessageTooBig { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        // Fill to exactly capacity: 3 messages of 4 payload words = 15.
        for _ in 0..3 {
            rb.enqueue(&[7; 4]).unwrap();
        }
        assert_eq!(rb.nb_free(), 0);
        match rb.enqueue(&[1]) {
            Err(Error::NoSpace) => {}
            other => panic!("unexpected {other:?}"),
        }
        for _ in 0..3 {
            assert_eq!(rb.dequeue().unwrap().unwrap(), vec![7; 4]);
        }
        assert_eq!(rb.dequeue().unwrap(), None);
        // And the state fully recovered.
        rb.enqueue(&[1, 2, 3]).unwrap();
        assert_eq!(rb.dequeue().unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn wrap_around_preserves_messages() {
        let rb = RingBuf::create(&tmp("wrap.rb"), 8).unwrap();
        for i in 0..1000u32 {
            rb.enqueue(&[i, !i]).unwrap();
            assert_eq!(rb.dequeue().unwrap().unwrap(), vec![i, !i]);
        }
    }

    #[test]
    fn crash_between_alloc_and_commit_is_invisible() {
        let path = tmp("crash.rb");
        {
            let rb = RingBuf::create(&path, 64).unwrap();
            rb.enqueue(&[1, 2]).unwrap();
            rb.enqueue(&[3, 4]).unwrap();
            // Producer "crashes" here: words reserved, never committed.
            let _leaked = rb.enqueue_alloc(5).unwrap();
        }
        let rb = RingBuf::load(&path).unwrap();
        assert_eq!(rb.dequeue().unwrap().unwrap(), vec![1, 2]);
        assert_eq!(rb.dequeue().unwrap().unwrap(), vec![3, 4]);
        // The reader never observes the partial message.
        assert_eq!(rb.dequeue().unwrap(), None);
    }

    #[test]
    fn load_rejects_corrupt_headers() {
        let path = tmp("corrupt.rb");
        {
            let rb = RingBuf::create(&path, 16).unwrap();
            rb.header(PROD_HEAD).store(999, Ordering::Relaxed);
        }
        match RingBuf::load(&path) {
            Err(Error::Fatal { message }) => assert!(message.contains("out of range")),
            other => panic!("unexpected {other:?}"),
        }
        std::fs::write(&path, b"tiny").unwrap();
        assert!(RingBuf::load(&path).is_err());
    }

    proptest! {
        #[test]
        fn prop_fifo_identity(msgs in prop::collection::vec(
            prop::collection::vec(any::<u32>(), 1..12), 1..50,
        )) {
            let path = tmp(&format!("prop-{}.rb", std::process::id()));
            let rb = RingBuf::create(&path, 256).unwrap();
            let mut pending = std::collections::VecDeque::new();
            for m in &msgs {
                // Drain when full, like a worker under backpressure.
                loop {
                    match rb.enqueue(m) {
                        Ok(()) => break,
                        Err(Error::NoSpace) => {
                            let got: Vec<u32> = rb.dequeue().unwrap().unwrap();
                            let want: Vec<u32> = pending.pop_front().unwrap();
                            prop_assert_eq!(got, want);
                        }
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                pending.push_back(m.clone());
            }
            while let Some(want) = pending.pop_front() {
                prop_assert_eq!(rb.dequeue().unwrap().unwrap(), want);
            }
            prop_assert_eq!(rb.dequeue().unwrap(), None);
        }
    }
}
