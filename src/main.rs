use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use rakuten_ai::{
    ChatMode, ClientConfig, ContentBlock, DEFAULT_THREAD_TITLE, StreamEvent, Thread, User,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Send one prompt to the companion chat service and print the reply.
#[derive(Parser, Debug)]
#[command(name = "rakuten-ai")]
struct Args {
    /// Prompt to send
    prompt: String,

    /// USER_INPUT, DEEP_THINK or AI_READ
    #[arg(long, default_value = "USER_INPUT")]
    mode: ChatMode,

    /// Thread title
    #[arg(long, default_value = DEFAULT_THREAD_TITLE)]
    title: String,

    /// File to upload and attach to the prompt
    #[arg(long)]
    attach: Option<PathBuf>,

    /// MIME type of the attachment
    #[arg(long, default_value = "application/octet-stream")]
    mime: String,

    /// Upload the attachment as an image
    #[arg(long)]
    image: bool,

    /// Request signing secret
    #[arg(long, env = "RAKUTEN_AI_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    #[arg(long, env = "RAKUTEN_AI_BASE_URL", default_value = rakuten_ai::config::DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "RAKUTEN_AI_WS_URL", default_value = rakuten_ai::config::DEFAULT_WS_BASE_URL)]
    ws_url: String,

    #[arg(long, env = "RAKUTEN_AI_AGENT_ID", default_value = rakuten_ai::config::DEFAULT_AGENT_ID)]
    agent_id: String,

    /// Give up on a reply after this many seconds without a frame
    #[arg(long, env = "RAKUTEN_AI_FRAME_TIMEOUT_SECS")]
    frame_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(self.secret_key.clone())
            .with_base_url(&self.base_url)
            .with_ws_base_url(&self.ws_url)
            .with_agent_id(self.agent_id.clone());
        match self.frame_timeout_secs {
            Some(secs) => config.with_frame_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rakuten_ai={},warn", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    run(args).await.inspect_err(|err| error!("{}", err))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user = User::create(args.client_config()).await?;
    let thread = user.create_thread(&args.title).await?;
    eprintln!("thread {}", thread.id());
    converse_and_close(thread, &args).await
}

async fn converse_and_close(
    mut thread: Thread,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let result = converse(&mut thread, args).await;
    thread.close().await;
    result
}

async fn converse(
    thread: &mut Thread,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut contents = vec![ContentBlock::text(args.prompt.clone())];
    if let Some(path) = &args.attach {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let uploaded = thread.upload(bytes, &filename, &args.mime, args.image).await?;
        contents.push(ContentBlock::from(uploaded));
    }

    print_reply(thread, args.mode, &contents).await
}

async fn print_reply(
    thread: &mut Thread,
    mode: ChatMode,
    contents: &[ContentBlock],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut events = thread.send(mode, contents).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Ack => {}
            StreamEvent::TextDelta { text } => {
                print!("{}", text);
                stdout.flush()?;
            }
            StreamEvent::ReasoningStart => println!("[thinking]"),
            StreamEvent::ReasoningDelta { text } => println!("[reasoning] {}", text),
            StreamEvent::ImageThumbnail { url } => println!("\n[thumbnail] {}", url),
            StreamEvent::Image { url } => println!("[image] {}", url),
            StreamEvent::Notification { data } => println!("\n[notification] {}", data),
            StreamEvent::Done => println!(),
            StreamEvent::Disconnected => return Err("connection closed before the reply finished".into()),
            StreamEvent::DecodeError { message } => return Err(message.into()),
        }
    }
    Ok(())
}
