use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use mailchat::config::Config;
use mailchat::email::EmailSender;
use mailchat::otp::OtpService;
use mailchat::room::RoomManager;
use mailchat::server::ChatServer;
use mailchat::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailchat=info".into()),
        )
        .with_target(false)
        .init();

    let cfg = Config::load().context("failed to load configuration")?;
    info!(
        tcp_port = %cfg.tcp_port,
        smtp_host = %cfg.smtp_host,
        smtp_port = cfg.smtp_port,
        smtp_email = %cfg.smtp_email,
        otp_expiration_minutes = cfg.otp_expiration_minutes,
        otp_max_retries = cfg.otp_max_retries,
        username_min_length = cfg.username_min_length,
        username_max_length = cfg.username_max_length,
        "configuration loaded"
    );

    let sessions = SessionManager::new(cfg.username_min_length, cfg.username_max_length);
    let rooms = RoomManager::new();
    let otp = OtpService::new(cfg.otp_expiration(), cfg.otp_max_retries);
    let _reaper = otp.spawn_reaper();
    let email = EmailSender::smtp_from_config(&cfg)?;

    let server = ChatServer::new(sessions, rooms, otp, email);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", cfg.tcp_port))
        .await
        .with_context(|| format!("failed to bind port {}", cfg.tcp_port))?;
    info!(port = %cfg.tcp_port, "TCP chat server started");

    tokio::select! {
        res = server.run(listener) => res,
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// Resolves on SIGINT or SIGTERM. In-flight connections are not cancelled;
/// they end with the process.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
