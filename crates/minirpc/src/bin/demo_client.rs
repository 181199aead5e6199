//! Demonstration client exercising the demo server's procedures, sync calls
//! first and then an async one.

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use minirpc::RpcClient;

#[derive(Parser)]
#[command(about = "minirpc demonstration client")]
struct Args {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 6666)]
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct Fun {
    id: i32,
    name: String,
    age: i32,
}

const CALL_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> minirpc::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let client = RpcClient::new(args.host, args.port);
    client.connect_default().await?;

    // Sync calls.
    let dummy: String = client.call("get_dummy", &(1, 2.0), CALL_TIMEOUT).await?;
    println!("get_dummy: {dummy}");

    let sum: i32 = client.call("hello", &(1, 2), CALL_TIMEOUT).await?;
    println!("hello: {sum}");

    let name: String = client
        .call(
            "get_fun_name",
            &(Fun {
                id: 1,
                name: "xiaoqie".to_string(),
                age: 2,
            },),
            CALL_TIMEOUT,
        )
        .await?;
    println!("get_fun_name: {name}");

    let fun: Fun = client.call("get_fun", &(), CALL_TIMEOUT).await?;
    println!("get_fun: id={}, name={}, age={}", fun.id, fun.name, fun.age);

    let res: f64 = client.call("ff", &(1, 2.0), CALL_TIMEOUT).await?;
    println!("ff: {res}");

    client.call::<(), _>("print", &(), CALL_TIMEOUT).await?;
    println!("print: ok");

    // Async call: issue first, await later.
    let reply = client.async_call("get_dummy", &(1, 2.0))?;
    match tokio::time::timeout(Duration::from_secs(1), reply).await {
        Ok(result) => println!("async get_dummy: {}", result.decode::<String>()?),
        Err(_) => eprintln!("async get_dummy timed out"),
    }

    Ok(())
}
