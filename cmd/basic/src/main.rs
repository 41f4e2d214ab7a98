//! Basic cothread example
//!
//! Runs a handful of sleeping coroutines on a two-block shared stack pool,
//! then ping-pongs a counter between two coroutines over a socket pair.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - runtime log level
//! - `CO_SHARE_STACK_COUNT`, `CO_MAX_WAIT_MS`, ... - runtime configuration

use cothread::{init_thread_env, sleep_ms, Coroutine, CoroutineAttr, RuntimeConfig};
use std::cell::RefCell;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

// RUST_LOG=debug cargo run -p cothread-basic
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== cothread basic example ===\n");

    let config = RuntimeConfig::from_env()
        .share_stack_count(2)
        .share_stack_size(64 * 1024)
        .max_wait_ms(10);
    let env = match init_thread_env(config) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("failed to create environment: {}", e);
            std::process::exit(1);
        }
    };

    // Sleepers: spawned in reverse, finish in ascending sleep order
    let finished = Rc::new(RefCell::new(Vec::new()));
    let mut sleepers = Vec::new();
    for i in (1..=5u64).rev() {
        let done = finished.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            let marker = [i as u8; 256];
            tracing::debug!(i, "sleeping {} ms", i * 10);
            sleep_ms(i * 10).unwrap();
            assert!(marker.iter().all(|b| *b == i as u8));
            done.borrow_mut().push(i);
        })
        .and_then(|co| co.resume().map(|_| co));
        match co {
            Ok(co) => sleepers.push(co),
            Err(e) => eprintln!("spawn failed: {}", e),
        }
    }

    if let Err(e) = env.run_until(|_| sleepers.iter().all(|c| c.is_finished())) {
        eprintln!("event loop failed: {}", e);
    }
    println!("sleepers finished in order: {:?}", finished.borrow());
    if let Some(pool) = env.default_pool() {
        println!("shared stack stats: {:?}", pool.stats());
    }

    #[cfg(unix)]
    ping_pong(&env);

    println!("\n=== done ===");
}

#[cfg(unix)]
fn ping_pong(env: &Rc<cothread::Environment>) {
    use cothread::{poll, Interest, PollFd};
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const ROUNDS: u32 = 5;

    let (left, right) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("socketpair failed: {}", e);
            return;
        }
    };
    let _ = left.set_nonblocking(true);
    let _ = right.set_nonblocking(true);

    fn player(name: &'static str, mut sock: UnixStream, serve: bool) -> impl FnOnce() {
        move || {
            if serve {
                let _ = sock.write_all(&0u32.to_le_bytes());
            }
            loop {
                let mut fds = [PollFd::new(sock.as_raw_fd(), Interest::READABLE)];
                match poll(&mut fds, Some(1000)) {
                    Ok(0) => {
                        println!("{name}: timed out");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        println!("{name}: poll failed: {e}");
                        return;
                    }
                }
                if fds[0].revents.is_hangup() && !fds[0].revents.is_readable() {
                    println!("{name}: peer hung up");
                    return;
                }
                let mut buf = [0u8; 4];
                if sock.read_exact(&mut buf).is_err() {
                    println!("{name}: peer closed");
                    return;
                }
                let n = u32::from_le_bytes(buf);
                println!("{name}: got {n}");
                if n >= ROUNDS {
                    return;
                }
                let _ = sock.write_all(&(n + 1).to_le_bytes());
            }
        }
    }

    let players: Vec<_> = [("ping", left, true), ("pong", right, false)]
        .into_iter()
        .filter_map(|(name, sock, serve)| {
            Coroutine::new(env, &CoroutineAttr::new(), player(name, sock, serve))
                .and_then(|co| co.resume().map(|_| co))
                .map_err(|e| eprintln!("{name}: spawn failed: {e}"))
                .ok()
        })
        .collect();

    if let Err(e) = env.run_until(|_| players.iter().all(|c| c.is_finished())) {
        eprintln!("event loop failed: {}", e);
    }
}
