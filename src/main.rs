#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use log::warn;
use tokio_util::sync::CancellationToken;
use ustb_sso::{
    settings::SsoSettings, utils::logging::init_logging, AuthError, AuthResult, AuthSession,
    MethodKind, PlatformRegistration, ReqwestSession,
};

const USAGE: &str = "\
Usage:
  ustb-sso <platform> qr [--qr-path PATH]
  ustb-sso <platform> sms
  ustb-sso methods <platform>";

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login {
        platform: String,
        method: MethodKind,
        qr_path: PathBuf,
    },
    Methods {
        platform: String,
    },
}

impl Command {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        match args.as_slice() {
            [methods, platform] if methods == "methods" => Ok(Command::Methods {
                platform: platform.clone(),
            }),
            [platform, method, rest @ ..] => {
                let method: MethodKind = method.parse().map_err(|e: String| anyhow!(e))?;
                let qr_path = match rest {
                    [] => PathBuf::from("qr.png"),
                    [flag, path] if flag == "--qr-path" => PathBuf::from(path),
                    _ => bail!("unexpected arguments\n{USAGE}"),
                };
                Ok(Command::Login {
                    platform: platform.clone(),
                    method,
                    qr_path,
                })
            }
            _ => bail!("{USAGE}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SsoSettings::load().context("Failed to load settings")?;
    init_logging(&settings.logging).context("Failed to initialize logging")?;

    let command = Command::parse(std::env::args().skip(1))?;
    let platform_name = match &command {
        Command::Login { platform, .. } | Command::Methods { platform } => platform,
    };
    let platform = settings
        .platform(platform_name)
        .context("Invalid platform configuration")?
        .ok_or_else(|| anyhow!("unknown platform '{platform_name}'"))?;

    let http = ReqwestSession::new(&settings.http).context("Failed to build HTTP client")?;
    let polling = settings.polling.clone();
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling login");
            on_ctrl_c.cancel();
        }
    });

    let mut session =
        AuthSession::new(http, platform.clone(), settings).with_cancellation(cancel);
    list_methods(&mut session).await?;
    let result = match command {
        Command::Methods { .. } => return Ok(()),
        Command::Login {
            method: MethodKind::Qr,
            qr_path,
            ..
        } => {
            session
                .login_with_qr(
                    |challenge| match std::fs::write(&qr_path, &challenge.image_bytes) {
                        Ok(()) => println!(
                            "📷 Scan {} with the USTB app before {}",
                            qr_path.display(),
                            challenge.expires_at.format("%H:%M:%S")
                        ),
                        Err(e) => eprintln!("Failed to write {}: {e}", qr_path.display()),
                    },
                    polling.interval(),
                    polling.timeout(),
                )
                .await?
        }
        Command::Login {
            method: MethodKind::Sms,
            ..
        } => login_with_sms(&mut session).await?,
    };
    report(&platform, &result)
}

async fn list_methods(session: &mut AuthSession<ReqwestSession>) -> anyhow::Result<()> {
    let catalog = session
        .procedure_mut()
        .open()
        .await
        .context("Failed to discover authentication methods")?;
    for descriptor in catalog.iter() {
        println!(
            "{:<12} {:<20} {}{}",
            descriptor.module_code,
            descriptor.chain_name,
            descriptor.module_name,
            if descriptor.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

async fn login_with_sms(session: &mut AuthSession<ReqwestSession>) -> anyhow::Result<AuthResult> {
    let procedure = session.procedure_mut();
    procedure.select_method(MethodKind::Sms)?;

    let phone = prompt("Phone number")?;
    if !procedure.check_eligible(&phone).await? {
        bail!("{phone} cannot receive login codes for this platform");
    }

    let mut challenge = procedure.send_code(&phone).await?;
    loop {
        let code = prompt("SMS code")?;
        match procedure.submit_code(&challenge, &code).await {
            Ok(token) => return Ok(procedure.complete(token).await?),
            Err(AuthError::CodeIncorrect {
                attempts,
                max_attempts,
            }) => eprintln!("Wrong code ({attempts}/{max_attempts}), try again"),
            Err(AuthError::CodeExhausted { .. }) => {
                eprintln!("Too many wrong codes, sending a new one");
                challenge = loop {
                    match procedure.send_code(&phone).await {
                        Err(AuthError::RateLimited { retry_after }) => {
                            eprintln!("Waiting {}s before resending", retry_after.as_secs());
                            tokio::time::sleep(retry_after).await;
                        }
                        other => break other?,
                    }
                };
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("no input");
    }
    Ok(line.trim().to_string())
}

fn report(platform: &PlatformRegistration, result: &AuthResult) -> anyhow::Result<()> {
    println!("🎉 Logged in to {} at {}", platform.name, result.final_url);
    let mut cookies: Vec<_> = result.cookies.iter().collect();
    cookies.sort();
    for (name, value) in cookies {
        println!("{name}={value}");
    }
    if !result.satisfies(platform) {
        bail!(
            "login ended at {} which does not look like a {} session",
            result.final_url,
            platform.name
        );
    }
    Ok(())
}
