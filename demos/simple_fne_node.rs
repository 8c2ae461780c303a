use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use fnegateway::fne::config::{MasterConfig, PeerConfig};
use fnegateway::fne::master::FneMaster;
use fnegateway::fne::peer::FnePeer;
use fnegateway::fne::system::FneSystem;
use fnegateway::fne::transport::UdpTransport;
use fnegateway::routing::acl::{RadioIdLists, RadioIdSource};
use fnegateway::routing::link_control::{LinkControl, LinkControlCodec, PrivacyLc, EMBEDDED_LC_FRAGMENTS, EMBEDDED_LC_FRAGMENT_LENGTH, FULL_LC_LENGTH};
use fnegateway::routing::router::{Router, RouterConfig};
use fnegateway::routing::rules::{RuleSource, RuleTable};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Runs a master named 'local' and, optionally, a peer named 'upstream' connected to another
///  master, routing between them according to a JSON rule file.
#[derive(Parser)]
struct Args {
    /// address the local master listens on
    master_address: String,
    passphrase: String,

    #[clap(long)]
    rules: PathBuf,
    #[clap(long)]
    radio_ids: Option<PathBuf>,

    #[clap(long)]
    upstream_master: Option<String>,
    #[clap(long, default_value_t = 0)]
    upstream_peer_id: u32,
    #[clap(long, default_value = "0.0.0.0:0")]
    upstream_bind_address: String,
    #[clap(long)]
    upstream_passphrase: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct FileRuleSource(PathBuf);

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn load(&self) -> anyhow::Result<RuleTable> {
        RuleTable::from_json(&tokio::fs::read(&self.0).await?)
    }
}

/// without a radio id file, all radio ids are permitted
struct FileRadioIdSource(Option<PathBuf>);

#[async_trait]
impl RadioIdSource for FileRadioIdSource {
    async fn load(&self) -> anyhow::Result<RadioIdLists> {
        match &self.0 {
            Some(path) => RadioIdLists::from_json(&tokio::fs::read(path).await?),
            None => Ok(RadioIdLists::default()),
        }
    }
}

/// No FEC library is linked into the demo, so link control can't be regenerated. Forwarded DMR
///  frames keep the link control they were received with.
struct NoFecCodec;

impl LinkControlCodec for NoFecCodec {
    fn encode_full(&self, _lc: &LinkControl, _data_type: u8) -> anyhow::Result<[u8; FULL_LC_LENGTH]> {
        bail!("no FEC library")
    }

    fn encode_embedded(&self, _lc: &LinkControl) -> anyhow::Result<[[u8; EMBEDDED_LC_FRAGMENT_LENGTH]; EMBEDDED_LC_FRAGMENTS]> {
        bail!("no FEC library")
    }

    fn decode_full(&self, _burst: &[u8], _data_type: u8) -> anyhow::Result<LinkControl> {
        bail!("no FEC library")
    }

    fn encode_pi_header(&self, _lc: &PrivacyLc) -> anyhow::Result<[u8; FULL_LC_LENGTH]> {
        bail!("no FEC library")
    }

    fn decode_pi_header(&self, _burst: &[u8]) -> anyhow::Result<PrivacyLc> {
        bail!("no FEC library")
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let rule_source = Arc::new(FileRuleSource(args.rules.clone()));
    let acl_source = Arc::new(FileRadioIdSource(args.radio_ids.clone()));

    let router = Router::new(
        Arc::new(RouterConfig::new()),
        rule_source.load().await?,
        acl_source.load().await?,
        Arc::new(NoFecCodec),
    );

    let master_addr: SocketAddr = args.master_address.parse()?;
    let master_config = Arc::new(MasterConfig::new("local", master_addr, &args.passphrase));
    let master_transport = Arc::new(UdpTransport::bind(master_addr).await?);
    let master = Arc::new(FneSystem::Master(FneMaster::new(master_config, master_transport, router.handler_for("local"))));
    router.attach(master.clone()).await;

    let upstream = match &args.upstream_master {
        Some(upstream_master) => {
            if args.upstream_peer_id == 0 {
                return Err(anyhow!("an upstream master requires --upstream-peer-id"));
            }
            let bind_addr: SocketAddr = args.upstream_bind_address.parse()?;
            let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
            let passphrase = args.upstream_passphrase.as_deref().unwrap_or(&args.passphrase);
            let config = Arc::new(PeerConfig::new("upstream", args.upstream_peer_id, transport.local_addr()?, upstream_master.parse()?, passphrase));

            let peer = Arc::new(FneSystem::Peer(FnePeer::new(config, transport, router.handler_for("upstream"))));
            router.attach(peer.clone()).await;
            Some(peer)
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            canceller.cancel();
        }
    });

    let run_upstream = async {
        match upstream {
            Some(peer) => peer.run(cancel.clone()).await,
            None => Ok(()),
        }
    };

    let (master_result, upstream_result, _) = tokio::join!(
        master.clone().run(cancel.clone()),
        run_upstream,
        router.run(cancel.clone(), rule_source, acl_source),
    );
    master_result?;
    upstream_result?;
    Ok(())
}
