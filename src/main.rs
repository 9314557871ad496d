use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use lisa_client::chat::controller::{ChatView, ClearOutcome, ConversationController, LoadOutcome, SendOutcome};
use lisa_client::chat::message::{Message, Sender, format_timestamp_ms};
use lisa_client::chat::thinking::THINKING_INTERVAL;
use lisa_client::chat::{ConversationEndpoint, Notice, NoticeKind, Notifier, Speaker};
use lisa_client::clock::{Clock, SystemClock};
use lisa_client::config::{ClientConfig, ConfigError};
use lisa_client::net::types::QuizReview;
use lisa_client::net::{ApiError, HttpApi};
use lisa_client::session::{
    ActivityBus, ActivityKind, Credential, CredentialRenewer, FileStore, SessionContext, SessionKeeper, StoreError,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("api request failed: {0}")]
    Api(#[from] ApiError),
    #[error("unknown topic `{0}`; run `lisa topics` to list them")]
    UnknownTopic(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "lisa", about = "LISA study assistant chat client")]
struct Cli {
    /// Seed the session with this access token before running.
    #[arg(long, env = "LISA_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// User id; defaults to the token's subject.
    #[arg(long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available chatbots.
    Topics,
    /// Print persisted history for a chatbot.
    History {
        source: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Interactive chat. Commands: /clear, /switch <topic>, /voice, /quit.
    Chat { source: String },
    /// Ask for an explanation of one quiz question.
    Explain(ExplainArgs),
    /// Forget the stored credential.
    Logout,
}

#[derive(Args, Debug)]
struct ExplainArgs {
    source: String,
    #[arg(long)]
    question: String,
    /// The chosen answer; omit for a skipped question.
    #[arg(long)]
    answer: Option<String>,
    #[arg(long)]
    correct: String,
    /// Every option, in display order.
    #[arg(long = "option")]
    options: Vec<String>,
}

struct Client {
    config: ClientConfig,
    session: SessionContext,
    clock: Arc<dyn Clock>,
    api: Arc<HttpApi>,
    controller: Arc<ConversationController>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, "could not load .env");
        }
    }

    let cli = Cli::parse();
    let client = connect(&cli)?;

    match cli.command {
        Command::Topics => run_topics(&client).await,
        Command::History { source, json } => run_history(&client, &source, json).await,
        Command::Chat { source } => run_chat(&client, &source).await,
        Command::Explain(args) => run_explain(&client, args).await,
        Command::Logout => {
            client.session.clear()?;
            println!("logged out");
            Ok(())
        }
    }
}

fn connect(cli: &Cli) -> Result<Client, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(user) = &cli.user {
        config.user = Some(user.clone());
    }

    let store = FileStore::open(&config.store_path)?;
    debug!(path = %store.path().display(), "session store opened");
    let session = SessionContext::new(Arc::new(store));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if let Some(token) = &cli.access_token {
        let seeded = Credential::new(token.as_str(), None);
        let fallback = clock.now_ms() + millis(config.refresh.renewed_lifetime);
        let expires_at_ms = seeded.jwt_expiry_ms().unwrap_or(fallback);
        session.set_credential(&Credential::new(token.as_str(), Some(expires_at_ms)))?;
        info!(expires_at = %format_timestamp_ms(expires_at_ms), "session seeded from access token");
    }

    let api = Arc::new(HttpApi::new(&config, session.clone(), Arc::clone(&clock))?);
    let mut controller = ConversationController::new(api.clone(), session.clone(), Arc::clone(&clock))
        .with_history_page_size(config.history_page_size)
        .with_speaker(Arc::new(TerminalSpeaker))
        .with_notifier(Arc::new(TerminalNotifier));
    if let Some(user) = &config.user {
        controller = controller.with_user(user.clone());
    }
    controller.set_voice_output(config.voice_output);

    Ok(Client { config, session, clock, api, controller: Arc::new(controller) })
}

async fn run_topics(client: &Client) -> Result<(), CliError> {
    for endpoint in client.controller.catalog().await? {
        let kind = if endpoint.is_aggregate() { "all topics" } else { "topic" };
        match &endpoint.quiz_topic_key {
            Some(quiz) => println!("{:<24} {} ({kind}, quiz: {quiz})", endpoint.source_key, endpoint.display_name),
            None => println!("{:<24} {} ({kind})", endpoint.source_key, endpoint.display_name),
        }
    }
    Ok(())
}

async fn run_history(client: &Client, source: &str, json: bool) -> Result<(), CliError> {
    let endpoint = resolve_endpoint(client, source).await?;
    let outcome = client.controller.select_endpoint(endpoint).await;
    debug!(?outcome, "history loaded");

    let view = client.controller.view();
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}

async fn run_explain(client: &Client, args: ExplainArgs) -> Result<(), CliError> {
    let endpoint = resolve_endpoint(client, &args.source).await?;
    client.controller.select_endpoint(endpoint).await;

    let review = QuizReview {
        question: args.question,
        user_answer: args.answer,
        correct_answer: args.correct,
        options: args.options,
    };
    let before = client.controller.view().messages.len();
    let outcome = client.controller.request_explanation(&review).await;
    debug!(?outcome, "explanation finished");
    for message in client.controller.view().messages.iter().skip(before) {
        print_message(message);
    }
    Ok(())
}

async fn run_chat(client: &Client, source: &str) -> Result<(), CliError> {
    let bus = ActivityBus::new(Arc::clone(&client.clock));
    let renewer: Arc<dyn CredentialRenewer> = client.api.clone();
    let keeper = SessionKeeper::mount(
        client.session.clone(),
        renewer,
        Arc::clone(&client.clock),
        &bus,
        client.config.refresh,
    );

    let result = chat_loop(client, &bus, source).await;
    keeper.teardown().await;
    result
}

async fn chat_loop(client: &Client, bus: &ActivityBus, source: &str) -> Result<(), CliError> {
    let controller = &client.controller;
    switch_to(client, source).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        bus.emit(ActivityKind::KeyDown);

        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("/quit" | "/exit", _) => break,
            ("/voice", _) => {
                let enabled = !controller.voice_output();
                controller.set_voice_output(enabled);
                println!("voice output {}", if enabled { "on" } else { "off" });
            }
            ("/clear", _) => {
                if let ClearOutcome::Rejected(reason) = controller.clear_history().await {
                    println!("cannot clear right now ({reason:?})");
                }
            }
            ("/switch", topic) if !topic.is_empty() => {
                if let Err(e) = switch_to(client, topic).await {
                    println!("{e}");
                }
            }
            ("/switch", _) => println!("usage: /switch <topic>"),
            _ => send_with_indicator(controller, line).await,
        }
    }
    Ok(())
}

async fn switch_to(client: &Client, source: &str) -> Result<(), CliError> {
    let endpoint = resolve_endpoint(client, source).await?;
    println!("== {} ==", endpoint.display_name);
    match client.controller.select_endpoint(endpoint).await {
        LoadOutcome::Loaded { .. } => print_view(&client.controller.view()),
        LoadOutcome::Empty | LoadOutcome::Failed | LoadOutcome::NoUser => {
            println!("No messages yet. Ask the first question.");
        }
        LoadOutcome::Discarded => {}
    }
    Ok(())
}

/// Send `text`, printing the rotating indicator until the reply lands.
async fn send_with_indicator(controller: &ConversationController, text: &str) {
    let send = controller.send_message(text);
    tokio::pin!(send);
    let mut ticker = tokio::time::interval(THINKING_INTERVAL);

    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            _ = ticker.tick() => {
                if let Some(frame) = controller.view().thinking {
                    eprintln!("{} {} {}", frame.emoji, frame.text, frame.subtitle);
                }
            }
        }
    };

    match outcome {
        SendOutcome::Answered | SendOutcome::Failed => {
            if let Some(reply) = controller.view().messages.last() {
                print_message(reply);
            }
        }
        SendOutcome::Rejected(reason) => debug!(?reason, "message not sent"),
        SendOutcome::Discarded => {}
    }
}

async fn resolve_endpoint(client: &Client, wanted: &str) -> Result<ConversationEndpoint, CliError> {
    client
        .controller
        .catalog()
        .await?
        .into_iter()
        .find(|e| e.source_key == wanted || e.display_name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| CliError::UnknownTopic(wanted.to_owned()))
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_view(view: &ChatView) {
    for message in &view.messages {
        print_message(message);
    }
}

fn print_message(message: &Message) {
    let who = match message.sender {
        Sender::User => "you",
        Sender::Bot => "lisa",
    };
    println!("[{}] {who}: {}", format_timestamp_ms(message.timestamp_ms), message.text);
    for source in message.sources.iter().flatten() {
        println!("    - {source}");
    }
}

fn prompt() -> Result<(), CliError> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    Ok(())
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

struct TerminalSpeaker;

impl Speaker for TerminalSpeaker {
    fn speak(&self, text: &str) {
        eprintln!("(speaking) {text}");
    }
}

struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Success => println!("✔ {}", notice.text),
            NoticeKind::Error => println!("✖ {}", notice.text),
        }
    }
}
