// ShakeShare Linux: discovery, encrypted sessions and the profile/badge/photo exchange as a daemon.

mod config;
mod discovery;
mod link;
mod store;
#[cfg(test)]
mod test_support;
mod transport;

use std::sync::Arc;

use anyhow::{bail, Context};
use shk_core::identity::load_or_create_user_uuid;
use shk_core::router::LocalProfile;
use shk_core::{
    AppEvent, Badge, Keypair, Link, ManagerError, ManagerHandle, RegistrationError, SessionManager, Stores,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::discovery::{Advert, Discovery};
use crate::link::LinuxLink;
use crate::store::{AlbumDir, FileFriendStore, FileIdentity};
use crate::transport::Transport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut burst = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("shk-linux {}", VERSION);
                return Ok(());
            }
            "--burst" => burst = true,
            other => bail!("unknown argument {other:?} (expected --burst or --version)"),
        }
    }

    let cfg = config::load()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, burst))
}

async fn run(cfg: Config, burst: bool) -> anyhow::Result<()> {
    let data_dir = cfg.data_dir();
    let user_uuid = load_or_create_user_uuid(&FileIdentity::new(&data_dir))
        .with_context(|| format!("user uuid in {}", data_dir.display()))?;
    let friends = FileFriendStore::open(&data_dir)
        .with_context(|| format!("friend list in {}", data_dir.display()))?;
    let stores = Stores {
        friends: Arc::new(friends),
        album: Arc::new(AlbumDir::new(&data_dir)),
    };

    let keypair = Arc::new(Keypair::generate());
    let local = keypair.identity(cfg.display_name.clone());
    let udp = Discovery::bind(cfg.discovery_port)
        .with_context(|| format!("discovery port {}", cfg.discovery_port))?;
    let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
        .await
        .with_context(|| format!("transport port {}", cfg.transport_port))?;

    let profile = LocalProfile {
        user_uuid: user_uuid.clone(),
        nickname: cfg.nickname.clone(),
        profile_url: cfg.profile_url.clone(),
        badges: cfg.badges.iter().map(|name| Badge::from_name(name)).collect(),
    };
    let core = cfg.core();
    let advert = Advert {
        identity: local.clone(),
        public_key: keypair.public_key().clone(),
        listen_port: cfg.transport_port,
    };
    let (service, accept_timeout) = (core.service_type.clone(), core.invite_timeout);
    let manager = SessionManager::spawn(core, local.clone(), profile, stores, |sink| {
        let discovery = Discovery::start(udp, cfg.discovery_port, advert, sink.clone());
        let transport = Transport::start(
            listener,
            keypair.clone(),
            local.clone(),
            service,
            sink,
            accept_timeout,
        );
        let link: Arc<dyn Link> = Arc::new(LinuxLink::new(discovery, transport));
        link
    })?;
    tracing::info!(
        local = %local,
        user = %user_uuid,
        data_dir = %data_dir.display(),
        "shk-linux {} running",
        VERSION
    );

    tokio::spawn(log_events(manager.clone(), cfg.auto_register));
    if burst {
        manager.run_discovery_burst(None).await?;
    } else {
        manager.start_advertising().await?;
        manager.start_browsing().await?;
    }

    wait_for_shutdown(&manager).await?;
    tracing::info!("shutting down");
    manager.shutdown().await?;
    Ok(())
}

/// Log what the exchange produces; with `auto_register`, befriend new peers under their own nickname.
async fn log_events(manager: ManagerHandle, auto_register: bool) {
    let mut events = manager.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "event log fell behind");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            AppEvent::PeerStateChanged { peer, state } => {
                tracing::info!(peer = %peer, ?state, "peer state")
            }
            AppEvent::ConnectFailed { peer, error } => {
                tracing::info!(peer = %peer, %error, "could not connect")
            }
            AppEvent::ProfileExchanged {
                peer_uuid,
                nickname,
                badges,
                known,
                ..
            } => tracing::info!(peer = %peer_uuid, %nickname, ?badges, known, "profile received"),
            AppEvent::RegistrationRequested {
                peer_uuid,
                suggested_nickname,
            } => {
                tracing::info!(peer = %peer_uuid, nickname = %suggested_nickname, "new peer");
                if auto_register {
                    register(&manager, &peer_uuid, &suggested_nickname).await;
                }
            }
            AppEvent::FriendRegistered { friend } => {
                tracing::info!(peer = %friend.uuid, nickname = %friend.nickname, "friend registered")
            }
            AppEvent::BadgeReceived { peer_uuid, badge } => {
                tracing::info!(peer = %peer_uuid, badge = %badge.name, "badge received")
            }
            AppEvent::PhotoReceived {
                peer_uuid,
                front,
                back,
                caption,
            } => tracing::info!(
                peer = %peer_uuid,
                front = front.len(),
                back = back.len(),
                %caption,
                "photo received"
            ),
        }
    }
}

/// Try `nickname`, then `nickname-2`, `nickname-3`, ... until one is free.
async fn register(manager: &ManagerHandle, uuid: &str, nickname: &str) {
    let base = if nickname.is_empty() { "friend" } else { nickname };
    let mut candidate = base.to_string();
    for n in 2..100 {
        match manager.confirm_registration(uuid, &candidate).await {
            Ok(_) => return,
            Err(ManagerError::Registration(RegistrationError::NicknameTaken(_))) => {
                candidate = format!("{base}-{n}");
            }
            Err(e) => {
                tracing::warn!(peer = %uuid, error = %e, "registration failed");
                return;
            }
        }
    }
    tracing::warn!(peer = %uuid, nickname = %base, "no free nickname");
}

/// Ctrl+C or SIGTERM ends the daemon; SIGUSR1 runs a discovery burst.
async fn wait_for_shutdown(manager: &ManagerHandle) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => return Ok(r?),
            _ = sigterm.recv() => return Ok(()),
            _ = sigusr1.recv() => {
                tracing::info!("discovery burst requested");
                manager.run_discovery_burst(None).await?;
            }
        }
    }
}
