mod completion;
mod config;
mod conversation;
mod error;
mod llm_client;
mod logging;
mod models;
mod request_id;
mod stream;
mod tools;

use clap::Parser;
use config::Config;
use conversation::{Conversation, FALLBACK_REPLY};
use error::ChatStreamError;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stream::{StreamCallbacks, StreamingCompletionClient, TurnOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chat-stream")]
#[command(about = "Stream chat completions from an OpenAI-compatible endpoint")]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Overrides llm_params.model from the config
    #[arg(short, long)]
    model: Option<String>,

    /// trace, debug, info, warn, error
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[arg(long)]
    log_file: Option<String>,

    /// socks and http proxy, example: socks5://192.168.0.2:10080
    #[arg(long)]
    proxy: Option<String>,

    /// Print the models the endpoint offers and exit
    #[arg(long)]
    list_models: bool,

    /// Do not offer local tools to the model
    #[arg(long)]
    no_tools: bool,

    /// Prompt to send; reads prompts from stdin line by line when omitted
    prompt: Option<String>,
}

/// Writes streamed text as it arrives. Output stops for good once the writer
/// refuses a write (e.g. stdout piped into a closed reader).
struct TerminalPrinter<W: Write> {
    out: W,
    printed: String,
    closed: bool,
}

impl<W: Write> TerminalPrinter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            printed: String::new(),
            closed: false,
        }
    }

    fn write_out(&mut self, text: &str) {
        if self.closed {
            return;
        }
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            warn!("Stopping output, stdout is unavailable: {}", e);
            self.closed = true;
        }
    }

    fn show(&mut self, text: &str) {
        let out = match text.strip_prefix(self.printed.as_str()) {
            Some(rest) => rest.to_string(),
            None => format!("\n{}", text),
        };
        self.write_out(&out);
        self.printed = text.to_string();
    }
}

impl<W: Write> StreamCallbacks for TerminalPrinter<W> {
    fn on_stream_update(&mut self, text: &str) {
        self.show(text);
    }

    fn on_stream_complete(&mut self, text: &str) {
        // Final text is sanitized and trimmed; reprint only if that changed it.
        if self.printed.trim() != text {
            self.show(text);
        }
    }

    fn on_error(&mut self, error: &ChatStreamError) {
        match error.status() {
            Some(status) => eprintln!("{} (HTTP {})", FALLBACK_REPLY, status),
            None => eprintln!("{} ({})", FALLBACK_REPLY, error),
        }
    }

    fn on_settled(&mut self) {
        if !self.printed.is_empty() {
            self.write_out("\n");
        }
        self.printed.clear();
    }
}

fn build_http_client(config: &Config, proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut client_builder = reqwest::Client::builder();
    if let Some(proxy) = proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    if let Some(secs) = config.stream_settings.connect_timeout_secs {
        client_builder = client_builder.connect_timeout(Duration::from_secs(secs));
    }
    Ok(client_builder.build()?)
}

async fn run_prompt(conversation: &mut Conversation, prompt: &str) {
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut printer = TerminalPrinter::new(std::io::stdout());
    let reply = conversation.submit(prompt, &cancel, &mut printer).await;
    ctrl_c.abort();

    match (&reply.outcome, &reply.text) {
        (TurnOutcome::Aborted, _) => eprintln!("[cancelled]"),
        (TurnOutcome::Completed(_), None) => eprintln!("[the model returned no text]"),
        _ => {}
    }
    if let Some(response) = reply.outcome.response() {
        debug!(
            response_id = ?response.id,
            history = conversation.messages().len(),
            "Turn finished"
        );
    }

    for invocation in tools::to_completed_tool_invocations(&reply.tool_results) {
        match serde_json::to_string(&invocation) {
            Ok(s) => info!("tool invocation: {}", s),
            Err(e) => warn!("Failed to render tool invocation {}: {}", invocation.id, e),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = Level::from_str(&args.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level: {}. Using WARN level.", args.log_level);
        Level::WARN
    });
    logging::init_logging(log_level, args.log_file.as_deref());

    let mut config = Config::from_file(&args.config)?;
    info!("Configuration loaded successfully from: {}", args.config);
    if let Some(model) = &args.model {
        config.llm_params.model = model.clone();
    }

    let http_client = Arc::new(build_http_client(&config, args.proxy.as_deref())?);
    let llm_client = llm_client::LlmClient::new(http_client, config.llm_params.clone());

    if args.list_models {
        let models = llm_client.list_models().await?;
        let mut stdout = std::io::stdout().lock();
        for id in models.ids() {
            writeln!(stdout, "{}", id)?;
        }
        return Ok(());
    }

    let client = StreamingCompletionClient::new(llm_client)
        .with_flush_interval(config.stream_settings.flush_interval());
    let mut conversation = Conversation::new(client, config.llm_params.model.clone()).with_tools(
        config.tool_settings.enabled && !args.no_tools,
        config.tool_settings.max_rounds,
    );
    if let Some(prompt) = &config.system_prompt {
        conversation = conversation.with_system_prompt(prompt.clone());
    }

    if let Some(prompt) = &args.prompt {
        run_prompt(&mut conversation, prompt).await;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        run_prompt(&mut conversation, prompt).await;
    }
    Ok(())
}
