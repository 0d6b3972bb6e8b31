//! TCP echo server on the strand runtime
//!
//! Every connection is one coroutine written as straight-line blocking
//! code; the reactor suspends and resumes it on readiness.
//!
//! Usage:
//!     cargo run --release -p strand-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900
//!
//!     # crude load:
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9900 & done

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use strand::{Address, IoManager, Ipv4Address, Runtime, RuntimeConfig, Socket};

static RUNNING: AtomicBool = AtomicBool::new(true);

static CONNS: AtomicU64 = AtomicU64::new(0);
static BYTES: AtomicU64 = AtomicU64::new(0);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9900);
    let workers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
        // Writes to a closed peer surface as errors, not process death
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let config = RuntimeConfig::from_env().workers(workers).name("echo");
    let rt = Runtime::new(config).expect("runtime setup failed");
    rt.start();

    let io = rt.io().clone();
    rt.submit(move || accept_loop(io, port));

    eprintln!("strand-echo: listening on 0.0.0.0:{} ({} workers)", port, workers);

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_secs(5));
        eprintln!(
            "strand-echo: conns={} bytes={}",
            CONNS.load(Ordering::Relaxed),
            BYTES.load(Ordering::Relaxed)
        );
    }

    eprintln!("\nstrand-echo: shutting down...");
    rt.stop();
    eprintln!("strand-echo: done.");
}

fn accept_loop(io: Arc<IoManager>, port: u16) {
    let listener = Socket::tcp4().expect("listener socket");
    listener
        .bind(&Address::Ip4(Ipv4Address::any(port)))
        .expect("bind");
    listener.listen(1024).expect("listen");
    listener.set_nonblocking(true).expect("nonblocking");

    loop {
        match listener.accept() {
            Ok(client) => {
                CONNS.fetch_add(1, Ordering::Relaxed);
                if client.set_nonblocking(true).is_err() {
                    continue;
                }
                io.submit(move || echo_session(client));
            }
            Err(e) => {
                eprintln!("strand-echo: accept failed: {}", e);
                return;
            }
        }
    }
}

fn echo_session(client: Socket) {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match client.recv(&mut buf, 0) {
            Ok(0) => return, // peer closed
            Ok(n) => n,
            Err(_) => return,
        };
        BYTES.fetch_add(n as u64, Ordering::Relaxed);

        let mut sent = 0;
        while sent < n {
            match client.send(&buf[sent..n], 0) {
                Ok(m) => sent += m,
                Err(_) => return,
            }
        }
    }
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
