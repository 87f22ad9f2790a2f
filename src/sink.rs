use std::{cell::RefCell, io, rc::Rc, time::Duration};

/// Flush interval used by `buffered()` when no explicit interval is given.
pub(crate) const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Output target shared between the middleware and the flush task.
pub(crate) type SharedWriter = Rc<RefCell<Box<dyn io::Write>>>;

/// Where rendered log lines go.
///
/// `Direct` writes each line to the underlying stream as it arrives.
/// `Buffered` queues lines in memory and lets a recurring task flush the
/// concatenation with a single write per interval, trading latency for
/// fewer write syscalls. A write failure never propagates to the request
/// being logged.
pub(crate) enum Sink {
    Direct(SharedWriter),
    Buffered { queue: Rc<RefCell<Vec<String>>> },
}

impl Sink {
    pub(crate) fn direct(writer: SharedWriter) -> Sink {
        Sink::Direct(writer)
    }

    /// Creates a buffered sink and spawns its flush task on the current
    /// arbiter. The task runs for the life of the process; there is no
    /// shutdown flush.
    pub(crate) fn buffered(writer: SharedWriter, every: Duration) -> Sink {
        let queue = Rc::new(RefCell::new(Vec::new()));
        let pending = Rc::clone(&queue);
        let _flusher = actix_web::rt::spawn(async move {
            let mut tick = actix_web::rt::time::interval(every);
            // the first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                flush(&pending, &writer);
            }
        });
        Sink::Buffered { queue }
    }

    /// Accepts one newline-terminated line. Never blocks: buffered sinks
    /// only enqueue, direct sinks hand the bytes to the writer.
    pub(crate) fn write(&self, line: String) {
        match self {
            Sink::Direct(writer) => {
                if let Err(err) = writer.borrow_mut().write_all(line.as_bytes()) {
                    log::debug!("access log write failed: {err}");
                }
            }
            Sink::Buffered { queue } => queue.borrow_mut().push(line),
        }
    }
}

/// Drains the queue and writes the FIFO concatenation in one call.
fn flush(queue: &RefCell<Vec<String>>, writer: &SharedWriter) {
    let pending = {
        let mut queue = queue.borrow_mut();
        if queue.is_empty() {
            return;
        }
        std::mem::take(&mut *queue)
    };
    if let Err(err) = writer.borrow_mut().write_all(pending.concat().as_bytes()) {
        log::debug!("access log flush failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records each underlying `write` call as a separate entry, so tests
    /// can distinguish one coalesced write from several.
    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl io::Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .borrow_mut()
                .push(String::from_utf8_lossy(buf).into_owned());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn shared(recorder: &Recorder) -> SharedWriter {
        Rc::new(RefCell::new(Box::new(recorder.clone()) as Box<dyn io::Write>))
    }

    #[test]
    fn direct_sink_writes_immediately() {
        let recorder = Recorder::default();
        let sink = Sink::direct(shared(&recorder));

        sink.write("one\n".to_owned());
        sink.write("two\n".to_owned());

        assert_eq!(*recorder.0.borrow(), vec!["one\n", "two\n"]);
    }

    #[actix_web::test]
    async fn buffered_sink_coalesces_into_one_write() {
        let recorder = Recorder::default();
        let sink = Sink::buffered(shared(&recorder), Duration::from_millis(50));

        sink.write("one\n".to_owned());
        sink.write("two\n".to_owned());
        sink.write("three\n".to_owned());
        assert!(recorder.0.borrow().is_empty());

        actix_web::rt::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*recorder.0.borrow(), vec!["one\ntwo\nthree\n"]);
    }

    #[actix_web::test]
    async fn buffered_sink_skips_empty_intervals() {
        let recorder = Recorder::default();
        let sink = Sink::buffered(shared(&recorder), Duration::from_millis(20));

        actix_web::rt::time::sleep(Duration::from_millis(70)).await;
        assert!(recorder.0.borrow().is_empty());

        sink.write("late\n".to_owned());
        actix_web::rt::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.borrow(), vec!["late\n"]);
    }
}
