// src/pipe.rs
//
// Record sinks for the capture stream. The default path writes straight to
// the fifo; the threaded variant hands complete records to a dedicated
// writer thread through two ring buffers (record sizes + record bytes) so a
// slow pipe reader cannot stall the serial poll loop.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ring_buffer::RingBuffer;

const WRITER_POLL_MS: u64 = 1;

pub struct ThreadedWriter {
    /// 4-byte little-endian record sizes. A size becomes visible only after
    /// its bytes are in the data ring, so the writer never sees a torn record.
    sizes: Arc<RingBuffer>,
    data: Arc<RingBuffer>,
    /// Producer raises this to let the writer drain and exit.
    done: Arc<AtomicBool>,
    /// Writer raises this when the sink failed; the producer reports it as a
    /// broken pipe.
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedWriter {
    pub fn new<W: Write + Send + 'static>(mut sink: W, data_capacity: usize) -> Self {
        let sizes = Arc::new(RingBuffer::new(4 * (data_capacity / 8 + 1)));
        let data = Arc::new(RingBuffer::new(data_capacity));
        let done = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let handle = {
            let sizes = Arc::clone(&sizes);
            let data = Arc::clone(&data);
            let done = Arc::clone(&done);
            let failed = Arc::clone(&failed);
            std::thread::spawn(move || {
                let mut size_bytes = [0u8; 4];
                loop {
                    if sizes.count() >= 4 {
                        sizes.read_into(&mut size_bytes);
                        let len = u32::from_le_bytes(size_bytes) as usize;
                        let mut record = vec![0u8; len];
                        data.read_into(&mut record);
                        if sink.write_all(&record).and_then(|_| sink.flush()).is_err() {
                            failed.store(true, Ordering::SeqCst);
                            return;
                        }
                    } else if done.load(Ordering::SeqCst) {
                        return;
                    } else {
                        std::thread::sleep(Duration::from_millis(WRITER_POLL_MS));
                    }
                }
            })
        };

        ThreadedWriter {
            sizes,
            data,
            done,
            failed,
            handle: Some(handle),
        }
    }

    fn sink_failed(&self) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer thread failed")
    }
}

impl Write for ThreadedWriter {
    /// One call is one record; callers hand over complete records.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.data.capacity() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record larger than the pipe buffer",
            ));
        }
        // Block politely until the writer has drained enough space.
        while self.data.free() < buf.len() || self.sizes.free() < 4 {
            if self.failed.load(Ordering::SeqCst) {
                return Err(self.sink_failed());
            }
            std::thread::sleep(Duration::from_millis(WRITER_POLL_MS));
        }
        // Data first, size second: the size is the writer's signal that the
        // record is complete.
        self.data.write(buf);
        self.sizes.write(&(buf.len() as u32).to_le_bytes());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.sizes.count() > 0 || self.data.count() > 0 {
            if self.failed.load(Ordering::SeqCst) {
                return Err(self.sink_failed());
            }
            std::thread::sleep(Duration::from_millis(WRITER_POLL_MS));
        }
        Ok(())
    }
}

impl Drop for ThreadedWriter {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn records_arrive_in_order() {
        let sink = SharedSink::default();
        let out = sink.0.clone();
        {
            let mut writer = ThreadedWriter::new(sink, 256);
            writer.write_all(&[1, 2, 3]).unwrap();
            writer.write_all(&[4, 5]).unwrap();
            writer.write_all(&[6]).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn producer_blocks_instead_of_overwriting() {
        let sink = SharedSink::default();
        let out = sink.0.clone();
        {
            let mut writer = ThreadedWriter::new(sink, 32);
            // Larger than half the buffer each; the second write must wait
            // for the thread to drain the first.
            writer.write_all(&vec![0xAA; 20]).unwrap();
            writer.write_all(&vec![0xBB; 20]).unwrap();
            writer.flush().unwrap();
        }
        let bytes = out.lock().unwrap();
        assert_eq!(bytes.len(), 40);
        assert!(bytes[..20].iter().all(|b| *b == 0xAA));
        assert!(bytes[20..].iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let sink = SharedSink::default();
        let mut writer = ThreadedWriter::new(sink, 16);
        let err = writer.write(&[0u8; 64]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
