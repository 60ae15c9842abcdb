use crate::error::{Error, Result};
use crate::io::{channel_source, RecordSource};

use std::sync::mpsc::sync_channel;
use std::thread::{self, JoinHandle};

/// A bounded in-memory batch read in one pass over a source.
#[derive(Debug)]
pub struct Chunk<T> {
    pub index: usize,
    pub records: Vec<T>,
}

impl<T> Chunk<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Cuts a forward-only record source into chunks of at most `max_chunk_size`
/// records. The sequence is finite and cannot be restarted.
pub struct Chunker<T> {
    source: RecordSource<T>,
    max_chunk_size: usize,
    produced: usize,
    exhausted: bool,
}

impl<T> Chunker<T> {

    pub fn new(source: RecordSource<T>, max_chunk_size: usize) -> Result<Chunker<T>> {
        if max_chunk_size < 1 {
            return Err(Error::config("chunk_size", "must be at least 1"));
        }
        Ok(Self { source, max_chunk_size, produced: 0, exhausted: false })
    }

    pub fn chunks_produced(&self) -> usize {
        self.produced
    }

    /// The next chunk, or `None` once the source is exhausted. A short final
    /// chunk is returned as is, an empty one never.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk<T>>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut records = Vec::with_capacity(self.max_chunk_size.min(1 << 16));
        while records.len() < self.max_chunk_size {
            match self.source.next() {
                Some(record) => records.push(record?),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if records.is_empty() {
            return Ok(None);
        }
        let chunk = Chunk { index: self.produced, records };
        self.produced += 1;
        Ok(Some(chunk))
    }
}

impl<T> Iterator for Chunker<T> {
    type Item = Result<Chunk<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

impl<T: Send + 'static> Chunker<T> {

    /// Moves the reading onto its own thread. Up to `capacity` chunks wait in
    /// a bounded hand-off, the reader blocks when it is full and the consumer
    /// when it is empty.
    pub fn read_ahead(self, capacity: usize) -> (RecordSource<Chunk<T>>, JoinHandle<()>) {
        let (tx, rx) = sync_channel(capacity.max(1));
        let reader = thread::spawn(move || {
            for chunk in self {
                let failed = chunk.is_err();
                // a closed receiver means the consumer gave up, stop reading
                if tx.send(chunk).is_err() || failed {
                    break;
                }
            }
        });
        (channel_source(rx), reader)
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::vec_source;

    #[test]
    fn chunks_are_bounded_and_final_chunk_short() {
        let mut chunker = Chunker::new(vec_source((0..10).collect::<Vec<u32>>()), 4).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| chunker.next_chunk().unwrap()).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(chunker.next_chunk().unwrap().is_none());
        assert_eq!(chunker.chunks_produced(), 3);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let chunker = Chunker::new(vec_source((0..8).collect::<Vec<u32>>()), 4).unwrap();
        let chunks: Vec<Chunk<u32>> = chunker.map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].index, 1);
        assert_eq!(chunks[1].records, vec![4, 5, 6, 7]);
    }

    #[test]
    fn empty_source() {
        let mut chunker = Chunker::new(vec_source(Vec::<u32>::new()), 3).unwrap();
        assert!(chunker.next_chunk().unwrap().is_none());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = Chunker::new(vec_source(vec![1u32]), 0).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn source_errors_propagate() {
        let source: RecordSource<u32> = Box::new(vec![Ok(1), Err(Error::format("test", "bad")), Ok(3)].into_iter());
        let mut chunker = Chunker::new(source, 10).unwrap();
        assert!(chunker.next_chunk().is_err());
    }

    #[test]
    fn read_ahead_preserves_order() {
        let chunker = Chunker::new(vec_source((0..100).collect::<Vec<u32>>()), 7).unwrap();
        let (chunks, reader) = chunker.read_ahead(2);
        let flat: Vec<u32> = chunks.flat_map(|c| c.unwrap().records).collect();
        reader.join().unwrap();
        assert_eq!(flat, (0..100).collect::<Vec<u32>>());
    }
}
