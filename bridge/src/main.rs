mod coordinator;
mod flow;
mod gateway;
mod host;
mod mqtt;
mod session;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
