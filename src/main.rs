use chainctl::config::Config;
use chainctl::errors::*;
use chainctl::manager::Manager;
use kube::Client;
use log::info;

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = libmain().await {
        eprintln!("chainctl exited with error: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn libmain() -> Result<()> {
    let config = Config::load()?;
    info!("loaded config: {:?}", config);

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    Ok(())
}
