//! Calculator served through a local hub.
//!
//! Demonstrates:
//! - Starting a hub on a random port
//! - Serving an object from one communicator
//! - Calling it through a dynamic proxy from another
//! - Passing a proxy as an argument for callbacks
//! - Remote errors surfacing as exceptions
//!
//! Usage:
//!   cargo run --example calculator
//!   cargo run --example calculator -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};

use tracing_subscriber::EnvFilter;
use wise_rpc::{Communicator, Error, Hub, Result, Servant, Value};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "wise_rpc=debug"
    } else {
        "wise_rpc=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    println!("=== Calculator ===\n");

    // ========================================================================
    // Hub
    // ========================================================================

    println!("[Setup] Starting hub...");
    let hub = Hub::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
    println!("        ✓ Listening on {}\n", hub.ws_url());

    // ========================================================================
    // Server
    // ========================================================================

    println!("[Server] Serving calculator...");
    let server = Communicator::initialize("127.0.0.1", hub.port()).await?;
    let adapter = server.create_object_adapter("calc", "-w calc").await?;

    let calculator = Servant::new()
        .with_method("add", |args| Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
        .with_method("divide", |args| {
            let divisor: f64 = args.arg(1)?;
            if divisor == 0.0 {
                return Err(Error::remote("DivisionByZero", "divisor is zero"));
            }
            Ok(args.arg::<f64>(0)? / divisor)
        })
        .with_async_method("countdown", |args| async move {
            let listener = args.proxy(0)?;
            let from: i64 = args.arg(1)?;
            for n in (0..=from).rev() {
                listener.invoke("tick", vec![n.into()]).await?;
            }
            Ok(Value::from("liftoff"))
        });
    adapter.add(calculator, "X")?;
    println!("        ✓ Calculator registered as 'X -w calc'\n");

    // ========================================================================
    // Client
    // ========================================================================

    println!("[Client] Resolving proxy...");
    let client = Communicator::initialize("127.0.0.1", hub.port()).await?;
    let calc = client.string_to_proxy("X -w calc").await?;
    let methods: Vec<&str> = calc.methods().collect();
    println!("        ✓ Methods: {methods:?}\n");

    println!("[Client] Calling add(2, 3)...");
    let sum: i64 = calc.call("add", vec![2.into(), 3.into()]).await?;
    println!("        ✓ {sum}\n");

    println!("[Client] Calling divide(1, 0)...");
    match calc.call::<f64>("divide", vec![1.into(), 0.into()]).await {
        Ok(quotient) => println!("        ✗ Unexpected result {quotient}\n"),
        Err(e) => println!("        ✓ Raised {e}\n"),
    }

    // ========================================================================
    // Callback
    // ========================================================================

    println!("[Client] Passing a listener to countdown(3)...");
    let callbacks = client.create_object_adapter("listener", "").await?;
    let listener = callbacks.add_with_uuid(Servant::new().with_method("tick", |args| {
        let n: i64 = args.arg(0)?;
        println!("        tick {n}");
        Ok(())
    }))?;
    let done: String = calc
        .call("countdown", vec![listener.into(), 3.into()])
        .await?;
    println!("        ✓ {done}\n");

    // ========================================================================
    // Shutdown
    // ========================================================================

    client.shutdown();
    server.shutdown();
    hub.shutdown();

    println!("=== Done ===");
    Ok(())
}
