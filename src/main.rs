use anyhow::{Context, Result, anyhow, bail};
use autumnus::{FormatterOption, Options, highlight, themes};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use futures::StreamExt;
use iocraft::prelude::*;
use std::{
    io::{self, Write},
    path::PathBuf,
};
use tokio::sync::watch;
use url::Url;

use crate::client::{FileInput, RETRY_DELAY, UploadClient, UploadEvent, plan_upload};
use crate::ui::{ConfigHeader, ErrorMessage, InputPrompt, ProgressBar, SuccessMessage};

mod client;
mod config;
mod rest_types;
mod ui;

#[derive(Parser)]
#[command(name = "lorry")]
#[command(version)]
#[command(about = "A client for synchronized chunk-round file uploads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure lorry interactively
    Config,
    /// Print the chunk plan for a file set without uploading
    Plan {
        /// Files as `field=path` pairs, or bare paths keyed by file stem
        #[arg(value_hint = ValueHint::FilePath, required = true, num_args = 1..)]
        files: Vec<String>,
    },
    /// Upload a set of files in synchronized chunk rounds
    Upload {
        /// Files as `field=path` pairs, or bare paths keyed by file stem
        #[arg(value_hint = ValueHint::FilePath, required = true, num_args = 1..)]
        files: Vec<String>,
        /// Auxiliary form fields for the completion request, as `key=value`
        #[arg(short, long)]
        field: Vec<String>,
        /// Override the chunk upload endpoint
        #[arg(long)]
        upload_url: Option<Url>,
        /// Override the completion endpoint
        #[arg(long)]
        complete_url: Option<Url>,
        /// Print the completion response body
        #[arg(long)]
        show_response: bool,
    },
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();

    rt.block_on(async {
        match cli.command {
            Commands::Config => interactive_config(),
            Commands::Plan { files } => plan_cmd(&files),
            Commands::Upload {
                files,
                field,
                upload_url,
                complete_url,
                show_response,
            } => {
                let (upload_url, complete_url) = resolve_endpoints(upload_url, complete_url)?;
                let client = UploadClient::new(upload_url, complete_url);
                upload_cmd(&client, &files, &field, show_response).await
            }
        }
    })
}

/// Endpoint overrides win; anything missing comes from the configured base
/// URL with the fixed routes joined on.
fn resolve_endpoints(upload_url: Option<Url>, complete_url: Option<Url>) -> Result<(Url, Url)> {
    if let (Some(upload), Some(complete)) = (upload_url.clone(), complete_url.clone()) {
        return Ok((upload, complete));
    }

    let config = config::read_config()?;
    let upload = match upload_url {
        Some(url) => url,
        None => config
            .upload_base_url
            .join(client::CHUNK_UPLOAD_ROUTE)
            .context("Failed to construct the chunk upload URL")?,
    };
    let complete = match complete_url {
        Some(url) => url,
        None => config
            .upload_base_url
            .join(client::COMPLETE_UPLOAD_ROUTE)
            .context("Failed to construct the completion URL")?,
    };

    Ok((upload, complete))
}

fn parse_file_spec(spec: &str) -> Result<FileInput> {
    if let Some((field, path)) = spec.split_once('=') {
        if field.is_empty() {
            bail!("Empty input identifier in '{spec}'");
        }
        return Ok(FileInput {
            field: field.to_string(),
            path: PathBuf::from(path),
        });
    }

    let path = PathBuf::from(spec);
    let field = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Cannot derive an input identifier from '{spec}'"))?;
    Ok(FileInput { field, path })
}

fn parse_field_spec(spec: &str) -> Result<(String, String)> {
    let (key, value) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid field '{spec}', expected key=value"))?;
    if key.is_empty() {
        bail!("Empty field name in '{spec}'");
    }
    Ok((key.to_string(), value.to_string()))
}

fn plan_cmd(specs: &[String]) -> Result<()> {
    let inputs = specs
        .iter()
        .map(|spec| parse_file_spec(spec))
        .collect::<Result<Vec<_>>>()?;
    let plan = plan_upload(&inputs)?;

    for file in &plan.files {
        println!(
            "{}: {} ({} bytes, {} chunk(s))",
            file.field,
            file.path.display(),
            file.size,
            file.chunk_count
        );
    }
    println!();
    println!("Rounds: {}", plan.rounds);
    println!("Total size: {} bytes", plan.total_size);

    Ok(())
}

async fn upload_cmd(
    client: &UploadClient,
    file_specs: &[String],
    field_specs: &[String],
    show_response: bool,
) -> Result<()> {
    let inputs = file_specs
        .iter()
        .map(|spec| parse_file_spec(spec))
        .collect::<Result<Vec<_>>>()?;
    let fields = field_specs
        .iter()
        .map(|spec| parse_field_spec(spec))
        .collect::<Result<Vec<_>>>()?;

    let plan = plan_upload(&inputs)?;
    let mut stream = client.upload(&plan, &fields);

    let (tx, rx) = watch::channel(0.0f32);

    let process_stream = async {
        let mut receipt = None;
        while let Some(event) = stream.next().await {
            match event? {
                UploadEvent::Progress(progress) => {
                    let _ = tx.send(progress.percent());
                }
                UploadEvent::Retrying { round, status } => {
                    let reason = status
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "connection error".to_string());
                    eprintln!(
                        "Round {} failed ({}), retrying in {}s",
                        round + 1,
                        reason,
                        RETRY_DELAY.as_secs()
                    );
                }
                UploadEvent::Complete(r) => {
                    let _ = tx.send(100.0);
                    receipt = Some(r);
                    break;
                }
            }
        }
        Ok::<_, anyhow::Error>(receipt.expect("Stream ended without Complete event"))
    };

    let mut progress_bar =
        element!(ProgressBar(title: "Uploading".to_string(), progress: Some(rx)));

    let result = tokio::select! {
        result = process_stream => result,
        _ = progress_bar.render_loop() => {
            unreachable!("render_loop should not terminate")
        }
    };

    let receipt = result?;

    element!(SuccessMessage(message: format!(
        "Upload complete: {} bytes in {} round(s)",
        receipt.total_size, plan.rounds
    )))
    .print();

    if let Some(redirect) = &receipt.redirect {
        println!("Continue at: {}", redirect);
    }

    if show_response && !receipt.response.is_empty() {
        let output = highlight(
            &serde_json::to_string_pretty(&receipt.response)?,
            Options {
                formatter: FormatterOption::Terminal {
                    theme: Some(
                        themes::get("ayu_light").expect("Syntax highlighting theme not found"),
                    ),
                },
                lang_or_file: Some("json"),
            },
        );
        println!("{}", output);
    }

    Ok(())
}

fn read_input(prompt: &str, default: Option<&str>, description: Option<&str>) -> Result<String> {
    element! {
        InputPrompt(
            prompt: prompt.to_string(),
            default: default.map(|s| s.to_string()),
            description: description.map(|s| s.to_string())
        )
    }
    .print();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    if input.is_empty() {
        if let Some(def) = default {
            Ok(def.to_string())
        } else {
            Ok(input)
        }
    } else {
        Ok(input)
    }
}

fn interactive_config() -> Result<()> {
    element!(ConfigHeader()).print();

    let upload_base_url = loop {
        let base_url_str = read_input(
            "Upload service base URL",
            None,
            Some("The chunk and completion routes are joined onto this URL"),
        )?;

        if base_url_str.is_empty() {
            element!(ErrorMessage(message: "A base URL is required".to_string())).print();
            println!();
            continue;
        }

        match Url::parse(&base_url_str) {
            Ok(url) => break url,
            Err(e) => {
                element!(ErrorMessage(message: format!("Invalid URL: {}", e))).print();
                println!();
            }
        }
    };

    let config_file = config::ConfigFile {
        upload_base_url: Some(upload_base_url),
    };
    config::write_config(config_file)?;

    element!(SuccessMessage(message: "Configuration complete!".to_string())).print();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_spec_accepts_pairs_and_bare_paths() {
        let pair = parse_file_spec("avatar=/tmp/me.png").unwrap();
        assert_eq!(pair.field, "avatar");
        assert_eq!(pair.path, PathBuf::from("/tmp/me.png"));

        let bare = parse_file_spec("/tmp/report.pdf").unwrap();
        assert_eq!(bare.field, "report");

        assert!(parse_file_spec("=/tmp/x").is_err());
    }

    #[test]
    fn field_spec_requires_key_value() {
        assert_eq!(
            parse_field_spec("title=Q3 report").unwrap(),
            ("title".to_string(), "Q3 report".to_string())
        );
        assert!(parse_field_spec("no-equals").is_err());
        assert!(parse_field_spec("=value").is_err());
    }
}
