use anyhow::{bail, Context};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "abfctl", about = "Anti-bruteforce gateway admin CLI.")]
struct Opt {
    /// The gateway RPC address (host:port).
    #[structopt(long = "addr", env = "ABF_ADDR", default_value = "127.0.0.1:8050")]
    addr: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Check whether an attempt is allowed
    Check {
        /// Login to check
        #[structopt(long = "login")]
        login: String,
        /// Password to check
        #[structopt(long = "pass")]
        pass: String,
        /// IP address to check
        #[structopt(long = "ip")]
        ip: String,
    },
    /// Reset the attempt buckets for a login/ip pair
    Reset {
        /// Login to reset
        #[structopt(long = "login")]
        login: String,
        /// IP to reset
        #[structopt(long = "ip")]
        ip: String,
    },
    /// Manage allowlist CIDRs
    Allowlist(ListCommand),
    /// Manage denylist CIDRs
    Denylist(ListCommand),
}

#[derive(Debug, StructOpt)]
enum ListCommand {
    /// Add a CIDR to the list
    Add {
        /// CIDR to add
        #[structopt(long = "cidr")]
        cidr: String,
    },
    /// Remove a CIDR from the list
    Remove {
        /// CIDR to remove
        #[structopt(long = "cidr")]
        cidr: String,
    },
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(opt).await {
        eprintln!("abfctl: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let client = Client::new(&opt.addr);

    match opt.command {
        Command::Check { login, pass, ip } => {
            let response = client
                .post(
                    "/v1/check",
                    serde_json::json!({ "login": login, "password": pass, "ip": ip }),
                )
                .await?;
            let allowed = response["ok"].as_bool().unwrap_or(false);
            if allowed {
                println!("Request is allowed");
            } else {
                println!("Request is not allowed");
            }
        }
        Command::Reset { login, ip } => {
            client
                .post("/v1/reset", serde_json::json!({ "login": login, "ip": ip }))
                .await?;
        }
        Command::Allowlist(list_command) => {
            client.manage_list("allowlist", list_command).await?;
        }
        Command::Denylist(list_command) => {
            client.manage_list("denylist", list_command).await?;
        }
    }

    Ok(())
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(addr: &str) -> Client {
        Client {
            http: reqwest::Client::new(),
            base: format!("http://{}", addr),
        }
    }

    async fn manage_list(&self, list: &str, command: ListCommand) -> anyhow::Result<()> {
        match command {
            ListCommand::Add { cidr } => {
                self.post(
                    &format!("/v1/{}/add", list),
                    serde_json::json!({ "cidr": cidr }),
                )
                .await?;
            }
            ListCommand::Remove { cidr } => {
                self.post(
                    &format!("/v1/{}/remove", list),
                    serde_json::json!({ "cidr": cidr }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.base))?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            bail!(
                "{}: {}",
                status,
                payload["error"].as_str().unwrap_or("request failed")
            );
        }
        Ok(payload)
    }
}
