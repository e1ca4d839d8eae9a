use std::collections::HashSet;
use std::sync::Arc;

use git_version::git_version;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use slog::*;
use sqlx::migrate::Migrate;
use structopt::StructOpt;

mod admin;
mod config;
mod limiter;
mod policy;
mod server;
mod subnet_store;
mod subnets;
mod updates;

use admin::SubnetAdmin;
use limiter::{BucketStore, MemBucketStore, RedisBucketStore};
use policy::{Dimension, LimitChecker, LimitRules, RateLimitService, Rule};
use server::ApiContext;
use subnet_store::{MemSubnetStore, PgSubnetStore, SubnetStore};
use subnets::SubnetHolder;
use updates::{LocalPublisher, RedisPublisher, SubnetUpdatesSubscriber, UpdatePublisher};

#[derive(Debug, StructOpt)]
#[structopt(name = "abf", about = "An anti-bruteforce gateway for authentication services.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(short = "c", long = "config", default_value = "/etc/abf/config.yml")]
    config: std::path::PathBuf,

    /// Run pending schema migrations against the configured database
    #[structopt(long = "db-upgrade")]
    migrate: bool,

    /// The path of the directory containing database migration files.
    #[structopt(
        long = "db-migration-directory",
        default_value = "/usr/share/abf/migrations"
    )]
    migration_directory: std::path::PathBuf,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    // Parse input arguments
    let opt = Opt::from_args();

    // Read the configuration file
    let config = config::load(&opt.config).expect("Failed to load config file");

    // Setup slog logging to stdout or to the configured log file
    let mut log_level = config.log_level;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let root_log = match &config.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("Failed to open log file");
            new_root_logger(log_file, log_level, GIT_VERSION)
        }
        None => new_root_logger(std::io::stdout(), log_level, GIT_VERSION),
    };

    slog::info!(root_log, "Arguments {:?}", opt);
    slog::debug!(root_log, "Parsed config {:?}", config);

    // Construct the storage backends for the selected workmode. External
    // mode shares state between replicas through Postgres and Redis; local
    // mode keeps everything in this process.
    let subnet_store: Arc<dyn SubnetStore>;
    let bucket_store: Arc<dyn BucketStore>;
    let mut broadcast: Option<(redis::Client, String)> = None;

    match config.workmode {
        config::Workmode::Local => {
            if opt.migrate {
                slog::error!(
                    root_log,
                    "There is no database to migrate in local workmode."
                );
                return;
            }
            subnet_store = Arc::new(MemSubnetStore::new());
            bucket_store = Arc::new(MemBucketStore::new());
        }
        config::Workmode::External => {
            let pg_config = config
                .postgres
                .as_ref()
                .expect("external workmode requires postgres configuration");
            let redis_config = config
                .redis
                .as_ref()
                .expect("external workmode requires redis configuration");

            // Connect to backing storage database
            let db_pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(pg_config.max_connections)
                .connect(&pg_config.dsn);
            let db_pool = tokio::time::timeout(std::time::Duration::from_secs(5), db_pool)
                .await
                .expect("DB connection timed out")
                .expect("Failed to connect to the database");
            let db_pool = Arc::new(db_pool);
            slog::info!(root_log, "Connected to subnet database");

            let mut migrator = sqlx::migrate::Migrator::new(opt.migration_directory.clone())
                .await
                .expect("Unable to read available database schema migrations");

            // If requested, run any necessary database migrations
            if opt.migrate {
                slog::warn!(
                    root_log,
                    "Running database migrations, this process can not be easily undone!"
                );
                migrator.set_ignore_missing(true);
                migrator
                    .run(db_pool.as_ref())
                    .await
                    .expect("Failed to run database migrations");
                slog::info!(root_log, "Migrations complete, exiting abf.");

                return;
            }

            // Get a set of available migrations and a set of applied migrations
            let available_migrations: HashSet<_> = migrator.iter().map(|x| x.version).collect();
            let applied_migrations: HashSet<_> = db_pool
                .as_ref()
                .acquire()
                .await
                .expect("Unable to acquire DB connection")
                .list_applied_migrations()
                .await
                .expect("Unable to query the applied DB schema migrations")
                .iter()
                .map(|x| x.version)
                .collect();

            if available_migrations != applied_migrations {
                slog::error!(
                    root_log,
                    "There is a difference between the expected set of DB schema migrations for this version of abf \
                    and the migrations applied to the configured database."
                );
                let unapplied_migrations: HashSet<_> = available_migrations
                    .difference(&applied_migrations)
                    .collect();
                let extra_migrations: HashSet<_> = applied_migrations
                    .difference(&available_migrations)
                    .collect();

                if !unapplied_migrations.is_empty() {
                    slog::error!(
                        root_log,
                        "The following migrations are expected by this version of abf, but not applied to the local database";
                        "unapplied_migrations" => format!("{:?}", unapplied_migrations)
                    );
                    if extra_migrations.is_empty() {
                        slog::error!(
                            root_log,
                            "You can upgrade your database schema to be compatible with this version of abf by manually running `abf --db-upgrade`"
                        );
                    }
                }

                if !extra_migrations.is_empty() {
                    slog::error!(
                        root_log,
                        "The following migrations are present in your database but unknown to this version of abf!";
                        "extra_migrations" => format!("{:?}", extra_migrations)
                    );
                }
                panic!("Cannot proceed without correcting the database schema.");
            }

            let redis_client = redis::Client::open(redis_config.url.as_str())
                .expect("Failed to parse the Redis address");
            let redis_store = tokio::time::timeout(
                redis_config.dial_timeout,
                RedisBucketStore::new(redis_client.clone()),
            )
            .await
            .expect("Redis connection timed out")
            .expect("Failed to connect to Redis");
            slog::info!(root_log, "Connected to counter store");

            subnet_store = Arc::new(PgSubnetStore::new(db_pool));
            bucket_store = Arc::new(redis_store);
            broadcast = Some((redis_client, redis_config.subnets_channel.clone()));
        }
    }

    // Build the subnet holder and hydrate it before accepting traffic.
    // Starting with unknown lists could let denied subnets through, so a
    // failed initial load aborts start-up.
    let holder = Arc::new(SubnetHolder::new(
        subnet_store.clone(),
        root_log.new(o!("subsystem" => "subnets")),
    ));
    holder
        .reload()
        .await
        .expect("Failed to load the initial subnet lists");

    let publisher: Arc<dyn UpdatePublisher> = match &broadcast {
        None => Arc::new(LocalPublisher::new(holder.clone())),
        Some((client, channel)) => Arc::new(
            RedisPublisher::new(client.clone(), channel.clone())
                .await
                .expect("Failed to connect the subnet update publisher"),
        ),
    };

    let checker = LimitChecker::new(bucket_store, limit_rules(&config.limits));
    let rate_limiter = Arc::new(RateLimitService::new(holder.clone(), checker));
    let subnet_admin = Arc::new(SubnetAdmin::new(
        subnet_store,
        publisher,
        root_log.new(o!("subsystem" => "subnet_admin")),
    ));

    let api_context = Arc::new(ApiContext {
        rate_limiter: Some(rate_limiter),
        subnet_admin: Some(subnet_admin),
        log: root_log.new(o!("subsystem" => "rpc")),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // In broadcast mode, run the subscriber loop that keeps this replica's
    // snapshot converged with admin mutations made anywhere. If it dies the
    // process shuts down instead of serving stale policy indefinitely.
    let subscriber_handle = broadcast.map(|(client, channel)| {
        let subscriber = SubnetUpdatesSubscriber::new(
            client,
            channel,
            holder.clone(),
            root_log.new(o!("subsystem" => "subnet_subscriber")),
        );
        let failure_tx = shutdown_tx.clone();
        let failure_log = root_log.clone();
        let subscriber_rx = shutdown_rx.clone();
        tokio::task::spawn(async move {
            if let Err(e) = subscriber.run(subscriber_rx).await {
                slog::error!(failure_log, "Subnet update subscriber failed"; "error" => e.to_string());
                let _ = failure_tx.send(true);
            }
        })
    });

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let api_context = api_context.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                server::handle_request(req, api_context.clone(), Some(remote_addr))
            }))
        }
    });

    let server = Server::bind(&config.listen).serve(make_svc);
    slog::info!(root_log, "Listening"; "address" => config.listen.to_string());

    let mut drain_rx = shutdown_rx.clone();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = drain_rx.changed().await;
    });
    let mut server_handle = tokio::task::spawn(graceful);

    // Block until an operator signal arrives or a child task pulls the plug.
    let mut failure_rx = shutdown_rx;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install the SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            slog::info!(root_log, "Interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            slog::info!(root_log, "Termination requested, shutting down");
        }
        _ = failure_rx.changed() => {
            slog::warn!(root_log, "Shutting down after internal failure");
        }
    }
    let _ = shutdown_tx.send(true);

    // Give in-flight requests a bounded drain period, then force the stop.
    match tokio::time::timeout(std::time::Duration::from_secs(5), &mut server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            slog::error!(root_log, "RPC server exited with error"; "error" => e.to_string());
        }
        Ok(Err(e)) => {
            slog::error!(root_log, "RPC server task failed"; "error" => e.to_string());
        }
        Err(_) => {
            slog::warn!(root_log, "Graceful drain timed out, forcing server stop");
            server_handle.abort();
        }
    }

    if let Some(handle) = subscriber_handle {
        let _ = handle.await;
    }
    slog::info!(root_log, "Shutdown complete");
}

fn new_root_logger<W>(sink: W, level: Level, build: &'static str) -> Logger
where
    W: std::io::Write + Send + 'static,
{
    let log_decorator = slog_term::PlainDecorator::new(sink);
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(
        drain,
        slog::o!("build" => build,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    )
}

fn limit_rules(limits: &config::Limits) -> LimitRules {
    let mut rules = LimitRules::new();
    rules.insert(
        Dimension::Login,
        Rule {
            limit: limits.login_attempts,
            window: limits.window,
        },
    );
    rules.insert(
        Dimension::Password,
        Rule {
            limit: limits.password_attempts,
            window: limits.window,
        },
    );
    rules.insert(
        Dimension::Ip,
        Rule {
            limit: limits.ip_attempts,
            window: limits.window,
        },
    );
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_rules_cover_all_dimensions() {
        let limits = config::Limits {
            login_attempts: 3,
            password_attempts: 30,
            ip_attempts: 300,
            window: std::time::Duration::from_secs(60),
        };
        let rules = limit_rules(&limits);
        assert_eq!(rules.get(&Dimension::Login).unwrap().limit, 3);
        assert_eq!(rules.get(&Dimension::Password).unwrap().limit, 30);
        assert_eq!(rules.get(&Dimension::Ip).unwrap().limit, 300);
        assert!(rules
            .values()
            .all(|rule| rule.window == std::time::Duration::from_secs(60)));
    }
}
