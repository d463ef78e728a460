use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trzsz::args::TransferArgs;
use trzsz::callback::NoopCallback;
use trzsz::cancel::StopToken;
use trzsz::error::Result;
use trzsz::files::check_path_writable;
use trzsz::protocol::frame::{FrameReader, FrameWriter};
use trzsz::protocol::Conversation;
use trzsz::terminal::{
    check_tmux, server_exit, terminal_columns, TmuxMode, TriggerLine, TriggerMode,
};
use trzsz::transfer::{finish_server_error, recv_files, CreatedFiles};

#[derive(Debug, Parser)]
#[command(
    name = "trz",
    version,
    about = "Receive file(s), similar to rz and compatible with tmux."
)]
struct Cli {
    #[command(flatten)]
    transfer: TransferArgs,

    /// Path to save file(s)
    #[arg(default_value = ".")]
    path: PathBuf,
}

type StdioConversation = Conversation<FrameReader<tokio::io::Stdin>, tokio::io::Stdout>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();

    let dest = match cli.path.canonicalize() {
        Ok(dest) => dest,
        Err(_) => {
            eprintln!("No such directory: {}", cli.path.display());
            return;
        }
    };
    if let Err(e) = check_path_writable(&dest) {
        eprintln!("{e}");
        return;
    }

    let tmux = check_tmux();
    if cli.transfer.binary && tmux.mode != TmuxMode::None {
        println!("Binary upload in tmux is not supported, auto switch to base64 mode.");
        cli.transfer.binary = false;
    }
    if cli.transfer.binary && cfg!(windows) {
        println!("Binary upload on Windows is not supported, auto switch to base64 mode.");
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
    let mode = if cli.transfer.directory {
        TriggerMode::RecvDir
    } else {
        TriggerMode::Recv
    };
    print!("{}", TriggerLine::new(mode, &tmux).render());
    let _ = std::io::Write::flush(&mut std::io::stdout());

    #[cfg(unix)]
    let raw_mode = trzsz::terminal::RawModeGuard::new().ok();

    let stop = StopToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                // Partial downloads are useless; roll them back on ^C.
                stop.stop_and_delete();
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

    let mut created = CreatedFiles::new();
    let message = match run(&mut conv, &dest, &mut created).await {
        Ok(message) => message,
        Err(err) => finish_server_error(&mut conv, &err, &mut created).await,
    };

    conv.clean_input(Duration::from_millis(500)).await;
    #[cfg(unix)]
    drop(raw_mode);
    server_exit(&message, conv.config.tmux_output_junk);
}

async fn run(
    conv: &mut StdioConversation,
    dest: &Path,
    created: &mut CreatedFiles,
) -> Result<String> {
    let action = conv.recv_action().await?;
    if !action.confirm {
        return Ok("Cancelled".to_string());
    }
    conv.send_config(&action).await?;

    // Progress renders on the initiator's side of the wire; any local
    // output here would land in the middle of the protocol stream.
    let local_list = recv_files(conv, dest, &mut NoopCallback, created).await?;

    conv.recv_exit().await?;
    Ok(format!(
        "Received {} to {}",
        local_list.join(", "),
        dest.display()
    ))
}
