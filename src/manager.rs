use std::sync::Arc;
use std::time::Duration;

use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::Api, client::Client};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use log::{info, warn};

use crate::config::Config;
use crate::crd::ChainTableOp;
use crate::errors::*;
use crate::reconcile::ChainTableReconciler;

// Context for our reconciler
#[derive(Clone)]
struct Data {
    reconciler: ChainTableReconciler,
}

async fn reconcile(op: Arc<ChainTableOp>, ctx: Arc<Data>) -> Result<Action> {
    ctx.reconciler.reconcile(op).await
}

fn error_policy(_op: Arc<ChainTableOp>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("reconcile failed: {}", error);
    Action::requeue(Duration::from_secs(60))
}

pub struct Manager {}

/// Owns the Controller for ChainTableOp.
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(client: Client, config: Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let context = Arc::new(Data {
            reconciler: ChainTableReconciler::new(client.clone(), config),
        });
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.get("chaintableops.chainctl.io")
            .await
            .chain_err(|| "install chaintableop crd first")?;
        crds.get("storageclusters.chainctl.io")
            .await
            .chain_err(|| "install storagecluster crd first")?;

        let ops = Api::<ChainTableOp>::all(client);

        let drainer = Controller::new(ops, watcher::Config::default())
            .run(reconcile, error_policy, context)
            .for_each(|o| {
                info!("Reconciled {:?}", o);
                futures::future::ready(())
            })
            .boxed();
        // what we do with the controller stream from .run() ^^ does not matter
        // but we do need to consume it, hence general printing + return future

        Ok((Self {}, drainer))
    }
}
