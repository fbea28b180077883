//! A windowless server loop. Presents into an in-memory [`Capture`] and takes
//! input from an [`Injector`], so the whole protocol runs without a display.

use std::{
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::{Duration, Instant},
};

use super::{Server, ServerEvent, Surface, update_period};
use crate::{config::SessionConfig, error::Result, palette::Rgb, registry::Registry};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Presents so far, this one included.
    pub seq: u64,
    pub page: usize,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.rgba.get(i..i + 3)?;
        Some(Rgb {
            r: px[0],
            g: px[1],
            b: px[2],
        })
    }
}

#[derive(Default)]
struct CaptureInner {
    last: Mutex<Option<Frame>>,
    presented: Condvar,
}

/// The most recent presentation of the headless server.
#[derive(Clone, Default)]
pub struct Capture {
    inner: Arc<CaptureInner>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.inner
            .last
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn record(&self, page: usize, width: u32, height: u32, rgba: &[u8]) {
        let mut last = self.lock();
        let seq = last.as_ref().map_or(0, |f| f.seq) + 1;
        *last = Some(Frame {
            seq,
            page,
            width,
            height,
            rgba: rgba.to_vec(),
        });
        self.inner.presented.notify_all();
    }

    pub fn last_frame(&self) -> Option<Frame> {
        self.lock().clone()
    }

    pub fn presents(&self) -> u64 {
        self.lock().as_ref().map_or(0, |f| f.seq)
    }

    /// Wait for a present that satisfies `pred`.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&Frame) -> bool) -> Option<Frame> {
        let deadline = Instant::now().checked_add(timeout);
        let mut last = self.lock();
        loop {
            if let Some(frame) = last.as_ref().filter(|f| pred(f)) {
                return Some(frame.clone());
            }
            let presented = &self.inner.presented;
            last = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    presented
                        .wait_timeout(last, deadline - now)
                        .unwrap_or_else(|err| err.into_inner())
                        .0
                }
                None => presented.wait(last).unwrap_or_else(|err| err.into_inner()),
            };
        }
    }
}

/// Feeds window-system events to a headless server.
#[derive(Clone)]
pub struct Injector {
    tx: Sender<ServerEvent>,
}

impl Injector {
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn key_down(&self, raw: i32) -> bool {
        self.send(ServerEvent::KeyDown(raw))
    }

    pub fn char(&self, ch: char) -> bool {
        self.send(ServerEvent::Char(ch))
    }

    pub fn mouse_move(&self, x: i32, y: i32) -> bool {
        self.send(ServerEvent::MouseMove { x, y })
    }

    pub fn mouse_button(&self, button: i32, down: bool) -> bool {
        self.send(ServerEvent::MouseButton { button, down })
    }

    pub fn close(&self) -> bool {
        self.send(ServerEvent::CloseRequested)
    }
}

pub fn channel() -> (Injector, Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel();
    (Injector { tx }, rx)
}

/// Initialize a server for `config` and run it until it exits.
pub fn serve(
    registry: Arc<dyn Registry>,
    config: SessionConfig,
    injector: Injector,
    events: Receiver<ServerEvent>,
    capture: Capture,
) -> Result<()> {
    let mut server = Server::initialize(registry, config)?;
    let tx = injector.tx;
    server.spawn_watchers(move |ev| tx.send(ev).is_ok())?;
    run(&mut server, &events, &capture);
    server.shutdown();
    Ok(())
}

fn present(server: &Server, capture: &Capture, scratch: &mut Vec<u8>) {
    let page = server.render(Surface::Visual, scratch);
    let config = server.config();
    capture.record(page, config.width, config.height, scratch);
}

pub fn run(server: &mut Server, events: &Receiver<ServerEvent>, capture: &Capture) {
    let period = update_period();
    let mut scratch = Vec::new();
    let mut next_tick = Instant::now() + period;
    present(server, capture, &mut scratch);

    loop {
        let now = Instant::now();
        let event = if now >= next_tick {
            next_tick = now + period;
            ServerEvent::Tick
        } else {
            match events.recv_timeout(next_tick - now) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => ServerEvent::CloseRequested,
            }
        };

        let outcome = server.handle(event);
        if outcome.redraw {
            present(server, capture, &mut scratch);
        }
        if outcome.exit {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_sees_a_later_present() {
        let capture = Capture::new();
        let writer = capture.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.record(1, 1, 1, &[1, 2, 3, 255]);
        });
        let frame = capture
            .wait_for(Duration::from_secs(2), |f| f.page == 1)
            .unwrap();
        assert_eq!(frame.pixel(0, 0), Some(Rgb { r: 1, g: 2, b: 3 }));
        assert_eq!(frame.pixel(1, 0), None);
        assert_eq!(capture.presents(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_without_a_deadline() {
        let capture = Capture::new();
        let writer = capture.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.record(0, 1, 1, &[0, 0, 0, 255]);
        });
        assert!(capture.wait_for(Duration::MAX, |f| f.seq == 1).is_some());
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_times_out() {
        let capture = Capture::new();
        assert!(capture.wait_for(Duration::from_millis(20), |_| true).is_none());
    }
}
