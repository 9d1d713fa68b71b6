// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use seamkv::cluster::{EtcdHelper, EtcdMasterLock, EtcdServerRegistry, EtcdTableDirectory};
use seamkv::master::{GrpcTabletServers, Master, MasterConfig, MasterEnv};
use seamkv::meta::EtcdMetaKv;
use seamkv::tablet::MetadataTable;
use tokio::select;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Meta cluster uri to store cluster wide metadata, e.g. etcd://etcd-cluster/scope.
    #[arg(long = "cluster.uri")]
    cluster_uri: String,
    /// Cluster name.
    #[arg(long = "cluster.name", default_value = "seamkv")]
    cluster_name: String,
    /// Interval between two reconciliation passes without events.
    #[arg(long = "master.pass-interval-ms", default_value_t = 5000)]
    pass_interval_ms: u64,
    /// Backoff after a failed pass.
    #[arg(long = "master.error-backoff-ms", default_value_t = 1000)]
    error_backoff_ms: u64,
    /// Batched tablets per live server before flushing in the middle of a pass.
    #[arg(long = "master.work-chunk", default_value_t = 5)]
    work_chunk: usize,
    /// Timeout of requests to tablet servers.
    #[arg(long = "master.rpc-timeout-ms", default_value_t = 10000)]
    rpc_timeout_ms: u64,
}

impl Args {
    fn master_config(&self) -> MasterConfig {
        MasterConfig::default()
            .with_pass_interval(Duration::from_millis(self.pass_interval_ms))
            .with_error_backoff(Duration::from_millis(self.error_backoff_ms))
            .with_work_chunk_per_server(self.work_chunk)
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_level(true).with_file(true).with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.master_config();
    let (mut client, root) = EtcdHelper::connect(&args.cluster_uri).await.context("fail to connect meta cluster")?;
    let root = format!("{root}/{}", args.cluster_name);

    info!("Waiting for master lock of cluster {root}");
    let lock = EtcdMasterLock::acquire(&mut client, &root).await?;
    let kv = EtcdMetaKv::new(client.clone(), &root).with_fence(lock.key().to_vec());
    let metadata = MetadataTable::new(Arc::new(kv));
    let servers = EtcdServerRegistry::watch(client.clone(), &root).await?;
    let tables = EtcdTableDirectory::watch(client, &root).await?;
    let rpc = GrpcTabletServers::new(config.rpc_timeout);
    let env = MasterEnv::new(metadata, Arc::new(servers), Arc::new(tables), Arc::new(lock), Arc::new(rpc))
        .with_config(config);

    let master = Master::new(env);
    let mut handle = master.start();
    info!("Serving as master of cluster {root}");
    select! {
        _ = handle.wait() => warn!("Lost master leadership"),
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping master");
            handle.stop().await;
        },
    }
    Ok(())
}
