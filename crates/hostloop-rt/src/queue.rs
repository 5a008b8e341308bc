use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, PoisonError};

use crate::isolate::run_isolated;

/// A deferred unit of work, run once on the loop thread.
pub type Message = Box<dyn FnOnce() + Send + 'static>;

const WAKEUP_BYTE: [u8; 1] = [0xff];

struct QueueState {
    messages: VecDeque<Message>,
    /// Wakeup bytes written (or reserved for writing) but not yet read.
    /// Never exceeds `MessageQueue::max_bytes`.
    pending_wakeup_bytes: usize,
    closed: bool,
}

/// FIFO of messages that any thread can post and the loop thread drains.
///
/// Each post writes one byte to a socket pair so a loop thread blocked in
/// poll wakes up, but at most `max_bytes` bytes are ever outstanding. Past
/// that, posts only enqueue: every drain empties the whole queue, so nothing
/// is stranded.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    reader: UnixStream,
    writer: UnixStream,
    max_bytes: usize,
}

impl MessageQueue {
    pub fn new(max_bytes: usize) -> io::Result<Self> {
        let (writer, reader) = UnixStream::pair()?;
        // A reserved byte may not have landed yet when the loop thread reads.
        reader.set_nonblocking(true)?;
        Ok(MessageQueue {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                pending_wakeup_bytes: 0,
                closed: false,
            }),
            reader,
            writer,
            max_bytes: max_bytes.max(1),
        })
    }

    /// Descriptor that becomes readable when messages are waiting.
    pub fn read_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Enqueue `f`. Returns false (and drops `f`) once the queue is closed.
    /// Never waits for the loop thread.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_message(Box::new(f))
    }

    pub fn post_message(&self, message: Message) -> bool {
        let write_wakeup = {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                drop(message);
                return false;
            }
            state.messages.push_back(message);
            if state.pending_wakeup_bytes < self.max_bytes {
                state.pending_wakeup_bytes += 1;
                true
            } else {
                false
            }
        };

        // The byte is already accounted for, so the write can happen without
        // the lock. At most `max_bytes` are in flight; the write cannot block.
        if write_wakeup {
            if let Err(err) = (&self.writer).write_all(&WAKEUP_BYTE) {
                tracing::warn!(message = "failed to write wakeup byte", ?err);
                self.release_wakeup_byte();
            }
        }
        true
    }

    /// Pop the oldest message, consuming one wakeup byte if any are
    /// outstanding. Loop thread only.
    pub fn pop_next(&self) -> Option<Message> {
        let (read_wakeup, message) = {
            let mut state = self.lock();
            let read_wakeup = state.pending_wakeup_bytes > 0;
            if read_wakeup {
                state.pending_wakeup_bytes -= 1;
            }
            (read_wakeup, state.messages.pop_front())
        };

        if read_wakeup {
            // If the poster's write has not landed yet the byte counts as
            // consumed; it is swept up by `drain` once it arrives.
            let mut byte = [0u8; 1];
            match (&self.reader).read(&mut byte) {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => tracing::warn!(message = "failed to read wakeup byte", ?err),
            }
        }
        message
    }

    /// Run every queued message, including ones posted while draining. A
    /// panicking message is logged and the drain moves on. Returns how many
    /// messages ran.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            while let Some(message) = self.pop_next() {
                run_isolated("message", message);
                count += 1;
            }
            // With the queue empty no byte is owed to a message, so anything
            // left in the socket is late. Re-check afterwards: a post racing
            // this sweep may have had its byte swept.
            self.discard_late_bytes();
            if self.is_empty() {
                break;
            }
        }
        count
    }

    fn discard_late_bytes(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => tracing::trace!(message = "discarded late wakeup bytes", n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(message = "failed to read wakeup byte", ?err);
                    break;
                }
            }
        }
    }

    /// Give back a byte reserved by a post whose write failed. The loop
    /// thread may already have counted it, so this saturates at zero.
    fn release_wakeup_byte(&self) {
        let mut state = self.lock();
        state.pending_wakeup_bytes = state.pending_wakeup_bytes.saturating_sub(1);
    }

    /// Refuse further posts and drop the backlog without running it. Returns
    /// the number of discarded messages.
    pub fn close(&self) -> usize {
        let backlog = {
            let mut state = self.lock();
            state.closed = true;
            mem::take(&mut state.messages)
        };
        // Dropped outside the lock: a message's captures may post on drop.
        backlog.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_wakeup_bytes(&self) -> usize {
        self.lock().pending_wakeup_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Messages run outside the lock, so a poisoned guard still holds
        // consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageQueue")
            .field("len", &state.messages.len())
            .field("pending_wakeup_bytes", &state.pending_wakeup_bytes)
            .field("max_bytes", &self.max_bytes)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Unread bytes currently sitting in the socket.
    fn bytes_in_socket(fd: RawFd) -> usize {
        let mut n: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
        assert_eq!(rc, 0, "FIONREAD failed");
        n as usize
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Message) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |n: u32| -> Message {
            let log = log_clone.clone();
            Box::new(move || log.lock().unwrap().push(n))
        };
        (log, make)
    }

    #[test]
    fn drain_preserves_post_order() {
        let queue = MessageQueue::new(128).unwrap();
        let (log, make) = recorder();
        for n in 0..20 {
            assert!(queue.post_message(make(n)));
        }

        assert_eq!(queue.drain(), 20);
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.pending_wakeup_bytes(), 0);
        assert_eq!(bytes_in_socket(queue.read_fd()), 0);
    }

    #[test]
    fn each_post_writes_one_byte_below_cap() {
        let queue = MessageQueue::new(128).unwrap();
        for _ in 0..3 {
            queue.post(|| {});
        }
        assert_eq!(queue.pending_wakeup_bytes(), 3);
        assert_eq!(bytes_in_socket(queue.read_fd()), 3);

        assert!(queue.pop_next().is_some());
        assert_eq!(queue.pending_wakeup_bytes(), 2);
        assert_eq!(bytes_in_socket(queue.read_fd()), 2);
    }

    #[test]
    fn wakeup_bytes_saturate_at_cap() {
        let queue = MessageQueue::new(16).unwrap();
        for _ in 0..5000 {
            queue.post(|| {});
            assert!(queue.pending_wakeup_bytes() <= 16);
        }

        assert_eq!(queue.len(), 5000);
        assert_eq!(queue.pending_wakeup_bytes(), 16);
        assert_eq!(bytes_in_socket(queue.read_fd()), 16);

        assert_eq!(queue.drain(), 5000);
        assert_eq!(queue.pending_wakeup_bytes(), 0);
        assert_eq!(bytes_in_socket(queue.read_fd()), 0);
    }

    #[test]
    fn cap_rearms_after_drain() {
        let queue = MessageQueue::new(2).unwrap();
        for _ in 0..10 {
            queue.post(|| {});
        }
        queue.drain();

        queue.post(|| {});
        assert_eq!(queue.pending_wakeup_bytes(), 1);
        assert_eq!(bytes_in_socket(queue.read_fd()), 1);
    }

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let queue = MessageQueue::new(4).unwrap();
        assert!(queue.pop_next().is_none());
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn panicking_message_does_not_stop_drain() {
        let queue = MessageQueue::new(128).unwrap();
        let (log, make) = recorder();
        queue.post_message(make(1));
        queue.post(|| panic!("message failed"));
        queue.post_message(make(2));

        assert_eq!(queue.drain(), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn messages_posted_while_draining_run_in_same_drain() {
        let queue = Arc::new(MessageQueue::new(128).unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let queue_clone = queue.clone();
        let hits_clone = hits.clone();

        queue.post(move || {
            let hits = hits_clone.clone();
            queue_clone.post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(queue.drain(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn closed_queue_rejects_and_discards() {
        let queue = MessageQueue::new(128).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            queue.post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(queue.close(), 3);
        assert!(queue.is_closed());
        assert!(!queue.post(|| {}));
        assert_eq!(queue.drain(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_posters_keep_per_thread_order() {
        const PER_THREAD: u32 = 50;

        let queue = Arc::new(MessageQueue::new(8).unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));

        let posters: Vec<_> = (0..2u32)
            .map(|t| {
                let queue = queue.clone();
                let log = log.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let log = log.clone();
                        queue.post(move || log.lock().unwrap().push((t, i)));
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().unwrap();
        }

        assert_eq!(queue.drain(), 100);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 100);
        for t in 0..2 {
            let mine: Vec<u32> = log
                .iter()
                .filter(|(who, _)| *who == t)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(mine, (0..PER_THREAD).collect::<Vec<_>>());
        }
    }

    /// Reserve a wakeup byte and enqueue `message` the way `post_message`
    /// does, without writing the byte yet.
    fn post_without_write(queue: &MessageQueue, message: Message) {
        let mut state = queue.lock();
        state.messages.push_back(message);
        state.pending_wakeup_bytes += 1;
    }

    #[test]
    fn pop_does_not_wait_for_a_byte_still_in_flight() {
        let queue = Arc::new(MessageQueue::new(128).unwrap());
        let (log, make) = recorder();
        post_without_write(&queue, make(1));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let queue_clone = queue.clone();
        thread::spawn(move || {
            done_tx.send(queue_clone.drain()).unwrap();
        });
        let ran = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("drain blocked on the wakeup socket");
        assert_eq!(ran, 1);
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(queue.pending_wakeup_bytes(), 0);

        // The poster's write lands after the message already ran.
        (&queue.writer).write_all(&WAKEUP_BYTE).unwrap();
        assert_eq!(bytes_in_socket(queue.read_fd()), 1);
        assert_eq!(queue.drain(), 0);
        assert_eq!(bytes_in_socket(queue.read_fd()), 0);

        // Accounting is intact for the next post.
        queue.post_message(make(2));
        assert_eq!(queue.pending_wakeup_bytes(), 1);
        assert_eq!(bytes_in_socket(queue.read_fd()), 1);
        assert_eq!(queue.drain(), 1);
        assert_eq!(bytes_in_socket(queue.read_fd()), 0);
    }

    #[test]
    fn releasing_an_already_consumed_byte_saturates() {
        let queue = MessageQueue::new(4).unwrap();
        post_without_write(&queue, Box::new(|| {}));
        // The loop thread counts the byte before the poster's write fails.
        assert!(queue.pop_next().is_some());
        assert_eq!(queue.pending_wakeup_bytes(), 0);

        queue.release_wakeup_byte();
        assert_eq!(queue.pending_wakeup_bytes(), 0);
    }
}
