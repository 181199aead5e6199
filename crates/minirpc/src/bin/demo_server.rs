//! Demonstration server exposing the sample procedure set.
//!
//! Run with `RUST_LOG=debug cargo run --bin demo_server` and point
//! `demo_client` at it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use minirpc::{RpcServer, ServerConfig};

#[derive(Parser)]
#[command(about = "minirpc demonstration server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 6666)]
    port: u16,

    /// Worker threads in the I/O pool.
    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// Idle timeout in seconds; 0 disables.
    #[arg(long, default_value_t = 15)]
    idle_timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Fun {
    id: i32,
    name: String,
    age: i32,
}

impl Fun {
    fn ff(&self, a: i32, b: f64) -> f64 {
        a as f64 + b
    }

    fn print(&self) {
        println!("Fun {{ id: {}, name: {}, age: {} }}", self.id, self.name, self.age);
    }
}

fn hello((a, b): (i32, i32)) -> i32 {
    a + b
}

fn get_dummy((_a, _b): (i32, f64)) -> String {
    "hello".to_string()
}

fn get_fun(_: ()) -> Fun {
    Fun {
        id: 1,
        name: "xiaoqie".to_string(),
        age: 20,
    }
}

fn get_fun_name((f,): (Fun,)) -> String {
    f.name
}

fn main() -> minirpc::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ServerConfig::new(args.port, args.pool_size);
    config.idle_timeout = Duration::from_secs(args.idle_timeout);

    let mut server = RpcServer::new(config);
    server.register("hello", hello);
    server.register("get_dummy", get_dummy);
    server.register("get_fun", get_fun);
    server.register("get_fun_name", get_fun_name);

    let fun = Arc::new(Fun {
        id: 1,
        name: "xiaoqie".to_string(),
        age: 20,
    });
    server.register_method("ff", Arc::clone(&fun), |f: &Fun, (a, b): (i32, f64)| f.ff(a, b));
    server.register_method("print", Arc::clone(&fun), |f: &Fun, _: ()| f.print());

    server.run()
}
