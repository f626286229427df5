use clap::Parser;
use futures::{AsyncWriteExt, FutureExt};
use rustyline_async::{Readline, SharedWriter};
use tokio::{select, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::ChannelCommandSink;
use crate::ugv::{UgvRequest, UgvResponse};

#[derive(Parser, Debug)]
#[clap(setting(clap::AppSettings::NoBinaryName))]
#[clap(rename_all = "kebab-case")]
enum Commands {
    #[clap(subcommand)]
    #[clap(name = "ugv")]
    Ugv(UgvRequest),
    Exit,
}

pub async fn run_interactive_cli(
    mut editor: Readline,
    mut stdout: SharedWriter,
    ugv_cmd_tx: ChannelCommandSink<UgvRequest, UgvResponse>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                break;
            }
            result = editor.readline().fuse() => {
                match result {
                    Ok(line) => {
                        stdout.write_all(format!("ugv> {}\n", line).as_bytes()).await?;

                        let request: Result<Commands, _> = Parser::try_parse_from(line.split_ascii_whitespace());

                        let request = match request {
                            Ok(request) => request,
                            Err(err) => {
                                stdout.write_all(err.to_string().as_bytes()).await?;
                                continue;
                            },
                        };

                        editor.add_history_entry(line);

                        match request {
                            Commands::Ugv(request) => {
                                let (ret_tx, ret_rx) = oneshot::channel();
                                if let Err(err) = ugv_cmd_tx.send_async((request, ret_tx)).await {
                                    error!("control task did not accept command: {:#?}", err);
                                    continue;
                                }
                                match ret_rx.await? {
                                    Ok(response) => info!("{}", serde_json::to_string(&response)?),
                                    Err(err) => error!("{}", err),
                                };
                            }

                            Commands::Exit => {
                                info!("exiting");
                                cancellation_token.cancel();
                            }
                        };
                    }
                    Err(err) => {
                        error!("interactive error: {:#?}", err);
                        break;
                    }
                };
            }
        }
    }

    cancellation_token.cancel();

    Ok(())
}
