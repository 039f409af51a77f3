//! A small routing demo: prefix mappings, shared state, an interceptor in
//! front of every route and a response finished from another thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use muxlet::{
    FilterChain, HandlerRegistration, InterceptorRegistration, Request, Response, Server,
    ServerConfig, ServerContext,
};

/// Adds a response header with the time spent in the rest of the chain.
fn timing(request: &mut Request, response: &mut Response, chain: &mut FilterChain) -> muxlet::Result<()> {
    let started = Instant::now();
    let result = chain.advance(request, response);
    println!("{} {} took {:?}", request.method(), request.path(), started.elapsed());
    result
}

fn main() {
    let counter = Arc::new(AtomicU64::new(0));

    let context = ServerContext::builder()
        .interceptor(InterceptorRegistration::new("timing", timing).with_pattern("/*"))
        .handler(
            HandlerRegistration::new("welcome", |_: &mut Request, resp: &mut Response| -> muxlet::Result<()> {
                resp.writer()?.println("Welcome to muxlet!")
            })
            .with_pattern("/"),
        )
        .handler(
            HandlerRegistration::new("hello", |req: &mut Request, resp: &mut Response| -> muxlet::Result<()> {
                let name = match req.path().trim_start_matches("/hello").trim_matches('/') {
                    "" => "world".to_string(),
                    name => name.to_string(),
                };
                resp.writer()?.println(&format!("Hello, {}!", name))
            })
            .with_pattern("/hello/*"),
        )
        .handler(
            HandlerRegistration::new("counter", move |_: &mut Request, resp: &mut Response| -> muxlet::Result<()> {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                resp.writer()?.println(&format!("Counter: {}", count))
            })
            .with_pattern("/counter"),
        )
        .handler(
            HandlerRegistration::new("slow", |_: &mut Request, resp: &mut Response| -> muxlet::Result<()> {
                let mut later = resp.start_async()?;
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(500));
                    let written = later.writer().and_then(|mut w| w.println("Finished later"));
                    if let Err(err) = written.and_then(|_| later.complete()) {
                        eprintln!("async response failed: {}", err);
                    }
                });
                Ok(())
            })
            .with_pattern("/slow"),
        )
        .build()
        .expect("invalid routes");

    let config = ServerConfig::new().expect("failed to load configuration");
    println!("Server running at http://{}", config.bind_addr());
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello/your-name");
    println!("  - /counter (increments on each visit)");
    println!("  - /slow (answered from another thread)");

    Server::http(config, context)
        .run()
        .expect("Server failed to start");
}
