//! chat-stream: one-shot CLI for the streaming chat channel.
//! Reads config, connects, sends the message read from stdin, prints the
//! streamed answer (and chart payload, if any) to stdout.

use chat_stream_client::{config, ChatRequest, Client, ConnectionState, ErrorKind};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::sync::mpsc;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

enum Output {
    Token(String),
    Full(String),
    Chart(serde_json::Value),
    Done { chart: Option<serde_json::Value> },
    Failed(String),
}

fn resolve_config_path() -> PathBuf {
    // 1. --config <path> flag
    let args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if let Some(path) = args.get(pos + 1) {
            return PathBuf::from(path);
        }
    }
    // 2. CHAT_STREAM_CONFIG env var
    if let Ok(val) = std::env::var("CHAT_STREAM_CONFIG") {
        return PathBuf::from(val);
    }
    // 3. Default path (~/.chat-stream/config.yaml)
    config::default_config_path().unwrap_or_else(|| {
        eprintln!("Error: unable to determine config path (set --config or CHAT_STREAM_CONFIG)");
        process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let config_path = resolve_config_path();

    let cfg = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    let Some(url) = cfg.server.url.clone() else {
        eprintln!("Error: server.url is not set in {}", config_path.display());
        process::exit(1);
    };
    let dataset_id = cfg.chat.dataset_id.clone().unwrap_or_default();

    // Read message from stdin (first line).
    let stdin = io::stdin();
    let message = {
        let mut line = String::new();
        stdin.lock().read_line(&mut line).unwrap_or(0);
        line.trim().to_string()
    };

    if message.is_empty() {
        eprintln!("Error: no message provided on stdin");
        process::exit(1);
    }

    let mut request = ChatRequest::new(message, dataset_id).streaming(cfg.chat.streaming.unwrap_or(true));
    if let Some(conversation) = cfg.chat.conversation_id.clone() {
        request = request.conversation(conversation);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let code = rt.block_on(run(cfg, url, request));
    process::exit(code);
}

async fn run(cfg: config::Config, url: String, request: ChatRequest) -> i32 {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (token_tx, full_tx, chart_tx, done_tx, err_tx) =
        (tx.clone(), tx.clone(), tx.clone(), tx.clone(), tx);

    let token_cfg = cfg.clone();
    let client = Client::builder(move || url.clone(), move || token_cfg.resolve_token())
        .options(cfg.client_options())
        .on_status(|s| {
            if let Some(content) = &s.content {
                eprintln!("[{}]", content);
            }
        })
        .on_token(move |t, _| {
            let _ = token_tx.send(Output::Token(t.to_string()));
        })
        .on_response_complete(move |t, _| {
            let _ = full_tx.send(Output::Full(t.to_string()));
        })
        .on_chart(move |c, _| {
            let _ = chart_tx.send(Output::Chart(c.clone()));
        })
        .on_done(move |c| {
            let _ = done_tx.send(Output::Done {
                chart: c.chart.clone(),
            });
        })
        .on_error(move |e| match e.kind() {
            // Transport hiccups are retried; only report them.
            ErrorKind::Connection => eprintln!("Warning: {}", e.error),
            _ => {
                let _ = err_tx.send(Output::Failed(e.error.to_string()));
            }
        })
        .build();

    if let Err(e) = client.connect().await {
        eprintln!("Error: {}", e);
        return 1;
    }
    // Idle here means the retry policy gave up.
    let mut state = client.watch_state();
    let settled = tokio::time::timeout(
        OPEN_TIMEOUT,
        state.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Idle)),
    )
    .await;
    let opened = match settled {
        Ok(Ok(s)) => *s == ConnectionState::Open,
        _ => false,
    };
    if !opened {
        eprintln!("Error: could not connect to the server");
        client.disconnect().await;
        return 1;
    }

    if let Err(e) = client.send(request) {
        eprintln!("Error: send failed: {}", e);
        client.disconnect().await;
        return 1;
    }

    let stdout = io::stdout();
    let mut streamed = false;
    let mut printed_chart = false;
    let mut code = 1;
    while let Some(output) = rx.recv().await {
        let mut out = stdout.lock();
        match output {
            Output::Token(t) => {
                streamed = true;
                let _ = write!(out, "{}", t);
                let _ = out.flush();
            }
            Output::Full(text) => {
                // Streaming already printed the same text token by token.
                if !streamed {
                    let _ = write!(out, "{}", text);
                }
            }
            Output::Chart(chart) => {
                let _ = writeln!(out, "\n\nChart:\n{}", chart);
                printed_chart = true;
            }
            Output::Done { chart } => {
                let _ = writeln!(out);
                if let (false, Some(chart)) = (printed_chart, chart) {
                    let _ = writeln!(out, "\nChart:\n{}", chart);
                }
                code = 0;
                break;
            }
            Output::Failed(msg) => {
                eprintln!("Server error: {}", msg);
                break;
            }
        }
    }

    client.disconnect().await;
    code
}
