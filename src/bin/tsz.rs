use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trzsz::args::TransferArgs;
use trzsz::callback::NoopCallback;
use trzsz::cancel::StopToken;
use trzsz::error::Result;
use trzsz::files::{check_duplicate_names, collect_transfer_list, FileRecord};
use trzsz::protocol::frame::{FrameReader, FrameWriter};
use trzsz::protocol::Conversation;
use trzsz::terminal::{
    check_tmux, server_exit, terminal_columns, TmuxMode, TriggerLine, TriggerMode,
};
use trzsz::transfer::{finish_server_error, send_files, CreatedFiles};

#[derive(Debug, Parser)]
#[command(
    name = "tsz",
    version,
    about = "Send file(s), similar to sz and compatible with tmux."
)]
struct Cli {
    #[command(flatten)]
    transfer: TransferArgs,

    /// File(s) to be sent
    #[arg(required = true)]
    file: Vec<PathBuf>,
}

type StdioConversation = Conversation<FrameReader<tokio::io::Stdin>, tokio::io::Stdout>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();

    let file_list = match collect_transfer_list(&cli.file, cli.transfer.directory) {
        Ok(list) => list,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    if cli.transfer.overwrite {
        if let Err(e) = check_duplicate_names(&file_list) {
            eprintln!("{e}");
            return;
        }
    }

    let tmux = check_tmux();
    if cli.transfer.binary && tmux.mode != TmuxMode::None {
        println!("Binary download in tmux is not supported, auto switch to base64 mode.");
        cli.transfer.binary = false;
    }
    if cli.transfer.binary && cfg!(windows) {
        println!("Binary download on Windows is not supported, auto switch to base64 mode.");
        cli.transfer.binary = false;
    }

    if tmux.mode == TmuxMode::Normal {
        // Reserve a line above the trigger so the pane redraw does not
        // overwrite the saved cursor position.
        if terminal_columns(&tmux) < 40 {
            print!("\n\n\x1b[2A\x1b[0J");
        } else {
            print!("\n\x1b[1A\x1b[0J");
        }
    }
    print!("{}", TriggerLine::new(TriggerMode::Send, &tmux).render());
    let _ = std::io::Write::flush(&mut std::io::stdout());

    #[cfg(unix)]
    let raw_mode = trzsz::terminal::RawModeGuard::new().ok();

    let stop = StopToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.stop();
            }
        });
    }

    let config = cli.transfer.to_config(&tmux);
    let newline = if cfg!(windows) { "!\n" } else { "\n" };
    let mut conv = Conversation::new(
        FrameReader::native(tokio::io::stdin(), stop.clone()),
        FrameWriter::new(tokio::io::stdout(), newline),
        config,
        stop,
    );

    // Nothing is created on the sending side; rollback is a no-op here.
    let mut created = CreatedFiles::new();
    let message = match run(&mut conv, &file_list).await {
        Ok(message) => message,
        Err(err) => finish_server_error(&mut conv, &err, &mut created).await,
    };

    conv.clean_input(Duration::from_millis(500)).await;
    #[cfg(unix)]
    drop(raw_mode);
    server_exit(&message, conv.config.tmux_output_junk);
}

async fn run(conv: &mut StdioConversation, file_list: &[FileRecord]) -> Result<String> {
    let action = conv.recv_action().await?;
    if !action.confirm {
        return Ok("Cancelled".to_string());
    }
    conv.send_config(&action).await?;

    send_files(conv, file_list, &mut NoopCallback).await?;

    // The initiator saved the files; its exit message says where.
    conv.recv_exit().await
}
