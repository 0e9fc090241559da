use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use lettre::transport::stub::AsyncStubTransport;
use tracing_subscriber::EnvFilter;

use microblog::config::Config;
use microblog::core::db::{init_test_data, Db};
use microblog::email::{default_backoff, smtp_transport, MailQueue};
use microblog::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let db = Db::open(&config.database_url)
        .with_context(|| format!("opening database {}", config.database_url))?;

    if config.seed_demo {
        init_test_data(&db).context("seeding demo data")?;
        tracing::info!("demo users test, alice and bob are available");
    }

    let (mail, _worker) = match &config.mail {
        Some(mail_config) => {
            tracing::info!(server = %mail_config.server, port = mail_config.port, "sending mail over SMTP");
            MailQueue::start(smtp_transport(mail_config)?, default_backoff())
        }
        None => {
            tracing::info!("MAIL_SERVER is not set, outgoing mail is only logged");
            MailQueue::start(AsyncStubTransport::new_ok(), default_backoff())
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = web::Data::new(AppState { db, config, mail });

    tracing::info!("server listening on http://{}", bind_addr);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(microblog::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("binding {}", bind_addr))?
    .run()
    .await?;

    Ok(())
}
