//! Readiness notification through the platform poller and the environment

#![cfg(unix)]

use cothread_core::Interest;
use cothread_runtime::{Coroutine, CoroutineAttr, Environment, Events, PollFd, Poller, RuntimeConfig, Selector};
use std::cell::Cell;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_peer_close_reports_hangup() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut poller = Poller::new().unwrap();
    let mut events = Events::with_capacity(4).unwrap();
    poller.register(a.as_raw_fd(), Interest::READABLE, 42).unwrap();
    drop(b);

    assert_eq!(poller.wait(&mut events, Some(200)).unwrap(), 1);
    let ev = events.iter().next().unwrap();
    assert_eq!(ev.tag, 42);
    assert!(ev.hangup);
}

#[test]
fn test_read_write_single_event() {
    let (a, mut b) = UnixStream::pair().unwrap();
    let mut poller = Poller::new().unwrap();
    let mut events = Events::with_capacity(4).unwrap();
    poller
        .register(a.as_raw_fd(), Interest::READABLE | Interest::WRITABLE, 9)
        .unwrap();
    b.write_all(b"ping").unwrap();

    assert_eq!(poller.wait(&mut events, Some(200)).unwrap(), 1);
    let ev = events.iter().next().unwrap();
    assert_eq!(ev.tag, 9);
    assert!(ev.readable);
    assert!(ev.writable);
}

#[test]
fn test_coroutine_poll_sees_hangup() {
    let env = Environment::new(RuntimeConfig::new().max_wait_ms(5)).unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    let seen = Rc::new(Cell::new(Interest::NONE));

    let (e, s) = (env.clone(), seen.clone());
    let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
        let mut fds = [PollFd::new(fd, Interest::READABLE)];
        let n = e.poll(&mut fds, Some(1000)).unwrap();
        assert_eq!(n, 1);
        s.set(fds[0].revents);
    })
    .unwrap();
    co.resume().unwrap();
    drop(b);

    env.run_until(|_| co.is_finished()).unwrap();
    assert!(seen.get().is_hangup());
    drop(a);
}

#[test]
fn test_io_before_timeout_resumes_once() {
    let env = Environment::new(RuntimeConfig::new().max_wait_ms(5)).unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    let wakeups = Rc::new(Cell::new(0u32));

    let (e, w) = (env.clone(), wakeups.clone());
    let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
        let mut fds = [PollFd::new(fd, Interest::READABLE)];
        let n = e.poll(&mut fds, Some(30)).unwrap();
        assert_eq!(n, 1);
        w.set(w.get() + 1);
        // park without a deadline so a stale timeout would show up
        e.yield_now().unwrap();
        w.set(w.get() + 100);
    })
    .unwrap();
    co.resume().unwrap();
    assert_eq!(env.pending_timeouts(), 1);

    b.write_all(b"x").unwrap();
    env.run_until(|_| wakeups.get() > 0).unwrap();
    assert_eq!(wakeups.get(), 1);
    assert_eq!(env.pending_timeouts(), 0);
    assert_eq!(env.waiting(), 0);

    std::thread::sleep(Duration::from_millis(40));
    for _ in 0..3 {
        env.run_once().unwrap();
    }
    assert_eq!(wakeups.get(), 1);
    assert!(!co.is_finished());
    drop(a);
}

#[test]
fn test_poll_timeout_returns_zero() {
    let env = Environment::new(RuntimeConfig::new().max_wait_ms(5)).unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    let result = Rc::new(Cell::new(None));

    let (e, r) = (env.clone(), result.clone());
    let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
        let mut fds = [PollFd::new(fd, Interest::READABLE)];
        r.set(Some(e.poll(&mut fds, Some(10)).unwrap()));
    })
    .unwrap();
    co.resume().unwrap();
    env.run_until(|_| co.is_finished()).unwrap();
    assert_eq!(result.get(), Some(0));
}

#[test]
fn test_root_poll_blocks_directly() {
    let env = Environment::new(RuntimeConfig::new()).unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    b.write_all(b"y").unwrap();
    let mut fds = [PollFd::new(a.as_raw_fd(), Interest::READABLE)];
    assert_eq!(env.poll(&mut fds, Some(100)).unwrap(), 1);
    assert!(fds[0].revents.is_readable());
}
