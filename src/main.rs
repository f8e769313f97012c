#[tokio::main(flavor = "current_thread")]
async fn main() {
    let res = exectop::app::run().await;
    if let Err(err) = res {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
