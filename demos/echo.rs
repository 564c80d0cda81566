use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use futures::executor::block_on;
use homa::{Config, HomaTransport, UdpDriver};
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    const SVR_PORT: u16 = 31850;
    const HELLO: &str = "Hello, world!";

    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();

    // Server thread.
    let server = thread::spawn({
        let stop = stop.clone();
        move || {
            let driver = UdpDriver::new(("127.0.0.1", SVR_PORT)).unwrap();
            let transport = HomaTransport::new(driver, 2, Config::default());
            transport.set_handler(|req| async move {
                let mut out = req.into_payload();
                out.make_ascii_uppercase();
                out
            });

            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Relaxed) {
                transport.poll();
            }
        }
    });

    // Client.
    let driver = UdpDriver::new("127.0.0.1:0").unwrap();
    let transport = HomaTransport::new(driver, 1, Config::default());
    log::info!("client running as {}", transport.service_locator());

    ready_rx.recv().unwrap();
    let sess = transport.get_session(SocketAddr::from(([127, 0, 0, 1], SVR_PORT)));

    let response = block_on(sess.request(HELLO.as_bytes().to_vec())).unwrap();
    println!("{}", String::from_utf8(response).unwrap());

    stop.store(true, Ordering::Relaxed);
    server.join().unwrap();
}
