use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored_json::{
    Color, ColorMode, ColoredFormatter, Output, Paint, PrettyFormatter, Style, Styler,
};
use serde_json::Value;

use rtm::{
    Client, EventKind, Logger, ReadOptions, ReadStatus, Reply, ReplyHandler, SubscribeOptions,
    SubscriptionEvent,
};

#[cfg(test)]
mod test;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Slice of a blocking read while subscribed, so the duration limit is honored.
const READ_SLICE: Duration = Duration::from_secs(1);

fn cli() -> Command {
    let channel = || Arg::new("CHANNEL").required(true).help("channel name");
    let message = || {
        Arg::new("MESSAGE")
            .required(true)
            .help("JSON message; anything that is not JSON is sent as a string")
    };
    let position = || {
        Arg::new("position")
            .short('p')
            .long("position")
            .value_name("POSITION")
            .help("position in the channel stream")
    };

    Command::new("rtm")
        .version(VERSION)
        .about("Talk to an RTM service")
        .subcommand_required(true)
        .arg(
            Arg::new("endpoint")
                .short('e')
                .long("endpoint")
                .env("RTM_ENDPOINT")
                .value_name("URL")
                .required(true)
                .help("ws:// or wss:// endpoint of the service"),
        )
        .arg(
            Arg::new("appkey")
                .short('k')
                .long("appkey")
                .env("RTM_APPKEY")
                .required(true)
                .help("application key"),
        )
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .env("RTM_ROLE")
                .help("authenticate as ROLE before doing anything else"),
        )
        .arg(
            Arg::new("secret")
                .short('s')
                .long("secret")
                .env("RTM_ROLE_SECRET")
                .hide_env_values(true)
                .help("secret key of the role"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .default_value("10")
                .help("time in seconds to wait for a reply"),
        )
        .arg(
            Arg::new("color")
                .long("color")
                .value_parser(["on", "off", "auto"])
                .default_value("auto")
                .help("colorize output"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("print debug"),
        )
        .subcommand(
            Command::new("publish")
                .about("Publish a message to a channel")
                .arg(channel())
                .arg(message()),
        )
        .subcommand(
            Command::new("write")
                .about("Write a message to a channel")
                .long_about("Write a message to CHANNEL. Same as publish, kept for key-value use.")
                .arg(channel())
                .arg(message()),
        )
        .subcommand(
            Command::new("read")
                .about("Read the latest message of a channel")
                .arg(channel())
                .arg(position()),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete the latest message of a channel")
                .arg(channel()),
        )
        .subcommand(
            Command::new("subscribe")
                .about("Print messages published to a channel")
                .arg(channel())
                .arg(
                    Arg::new("filter")
                        .short('f')
                        .long("filter")
                        .value_name("SQL")
                        .help("streamview filter; CHANNEL becomes the subscription id"),
                )
                .arg(position())
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_parser(value_parser!(u64))
                        .help("exit after COUNT messages"),
                )
                .arg(
                    Arg::new("duration")
                        .short('d')
                        .long("duration")
                        .value_name("SECONDS")
                        .value_parser(value_parser!(u64))
                        .help("exit after SECONDS"),
                ),
        )
}

fn parse_message(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}

fn should_colorize(matches: &ArgMatches) -> bool {
    match matches.get_one::<String>("color").map(String::as_str) {
        Some("on") => true,
        Some("off") => false,
        _ => ColorMode::should_colorize(Output::StdOut),
    }
}

struct Printer {
    mode: ColorMode,
    cf: ColoredFormatter<PrettyFormatter<'static>>,
}

impl Printer {
    fn new(should_colorize: bool) -> Self {
        let mode = if should_colorize {
            ColorMode::On
        } else {
            ColorMode::Off
        };
        let cf = ColoredFormatter::with_styler(
            PrettyFormatter::new(),
            Styler {
                array_brackets: Style::new(),
                object_brackets: Style::new(),
                key: Color::Blue.foreground(),
                string_value: Color::Green.foreground(),
                integer_value: Color::Yellow.foreground(),
                float_value: Color::Yellow.foreground(),
                bool_value: Color::Yellow.foreground(),
                nil_value: Color::Yellow.foreground(),
                string_include_quotation: true,
                object_colon: Default::default(),
            },
        );
        Printer { mode, cf }
    }

    fn print(&self, value: &Value) -> Result<()> {
        let text = self
            .cf
            .clone()
            .to_colored_json(value, self.mode)
            .with_context(|| format!("Failed to print json for '{value}'"))?;
        println!("{text}");
        Ok(())
    }
}

// Sends one request and waits for its reply; a negative reply is an error.
fn request<F>(client: &Client, timeout: Duration, what: &str, send: F) -> Result<Reply>
where
    F: FnOnce(ReplyHandler) -> rtm::Result<()>,
{
    let (tx, rx) = mpsc::channel();
    send(Box::new(move |reply| {
        let _ = tx.send(reply);
    }))
    .with_context(|| format!("Failed to send {what}"))?;

    if client.wait_all_replies(Some(timeout))? == ReadStatus::Timeout {
        bail!("Timed out waiting for the {what} reply");
    }
    let reply = rx
        .try_recv()
        .map_err(|_| anyhow!("No reply to {what}"))?;
    if reply.is_error() {
        bail!(
            "{what} failed: {} -- {}",
            reply.error().unwrap_or("unknown"),
            reply.reason().unwrap_or("")
        );
    }
    Ok(reply)
}

fn subscribe(client: &Client, matches: &ArgMatches, out: &Printer) -> Result<()> {
    let channel = matches
        .get_one::<String>("CHANNEL")
        .ok_or_else(|| anyhow!("No CHANNEL"))?;
    let mut options = SubscribeOptions::new();
    if let Some(filter) = matches.get_one::<String>("filter") {
        options = options.filter(filter.as_str());
    }
    if let Some(position) = matches.get_one::<String>("position") {
        options = options.position(position.as_str());
    }
    let count = matches.get_one::<u64>("count").copied();
    let duration = matches
        .get_one::<u64>("duration")
        .map(|s| Duration::from_secs(*s));

    let (tx, rx) = mpsc::channel::<SubscriptionEvent>();
    client.subscribe(channel, options, move |_, ev| {
        let _ = tx.send(ev.clone());
    })?;

    let start = Instant::now();
    let mut received = 0;
    loop {
        for ev in rx.try_iter() {
            match ev.kind {
                EventKind::Data => {
                    for message in ev.messages() {
                        out.print(message)?;
                        received += 1;
                        if count.map_or(false, |c| received >= c) {
                            return Ok(());
                        }
                    }
                }
                EventKind::Error | EventKind::Disconnect => bail!(
                    "Subscription '{channel}' failed: {} -- {}",
                    ev.error().unwrap_or("unknown"),
                    ev.reason().unwrap_or("")
                ),
                _ => {}
            }
        }

        let slice = match duration {
            Some(d) => {
                let elapsed = start.elapsed();
                if elapsed >= d {
                    return Ok(());
                }
                (d - elapsed).min(READ_SLICE)
            }
            None => READ_SLICE,
        };
        client.sock_read(Some(slice))?;
    }
}

fn do_main(matches: &ArgMatches) -> Result<()> {
    let endpoint = matches
        .get_one::<String>("endpoint")
        .ok_or_else(|| anyhow!("No endpoint"))?;
    let appkey = matches
        .get_one::<String>("appkey")
        .ok_or_else(|| anyhow!("No appkey"))?;
    let timeout = Duration::from_secs(matches.get_one::<u64>("timeout").copied().unwrap_or(10));
    let out = Printer::new(should_colorize(matches));

    let logger = if matches.get_flag("debug") {
        Logger::std(tracing::Level::DEBUG)
    } else {
        Logger::from_env()
    };
    let client = Client::builder(endpoint.as_str(), appkey.as_str())
        .logger(logger)
        .build()?;
    client
        .connect()
        .with_context(|| format!("Failed to connect to '{endpoint}'"))?;

    if let Some(role) = matches.get_one::<String>("role") {
        let secret = matches
            .get_one::<String>("secret")
            .ok_or_else(|| anyhow!("--role needs --secret"))?;
        request(&client, timeout, "authentication", |on_reply| {
            client.authenticate(role, secret, on_reply)
        })?;
    }

    let result = run(&client, matches, timeout, &out);
    client.close()?;
    result
}

fn run(client: &Client, matches: &ArgMatches, timeout: Duration, out: &Printer) -> Result<()> {
    let channel = |m: &ArgMatches| {
        m.get_one::<String>("CHANNEL")
            .cloned()
            .ok_or_else(|| anyhow!("No CHANNEL"))
    };
    let message = |m: &ArgMatches| {
        m.get_one::<String>("MESSAGE")
            .map(|s| parse_message(s))
            .ok_or_else(|| anyhow!("No MESSAGE"))
    };

    match matches.subcommand() {
        Some(("publish", sub)) => {
            let (channel, message) = (channel(sub)?, message(sub)?);
            let reply = request(client, timeout, "publish", |on_reply| {
                client.publish(&channel, &message, Some(on_reply))
            })?;
            out.print(reply.data())?;
        }
        Some(("write", sub)) => {
            let (channel, message) = (channel(sub)?, message(sub)?);
            let reply = request(client, timeout, "write", |on_reply| {
                client.write(&channel, &message, Some(on_reply))
            })?;
            out.print(reply.data())?;
        }
        Some(("read", sub)) => {
            let channel = channel(sub)?;
            let options = ReadOptions {
                position: sub.get_one::<String>("position").cloned(),
                ..ReadOptions::default()
            };
            let reply = request(client, timeout, "read", |on_reply| {
                client.read(&channel, options, Some(on_reply))
            })?;
            out.print(reply.message().unwrap_or(&Value::Null))?;
        }
        Some(("delete", sub)) => {
            let channel = channel(sub)?;
            let reply = request(client, timeout, "delete", |on_reply| {
                client.delete(&channel, Some(on_reply))
            })?;
            out.print(reply.data())?;
        }
        Some(("subscribe", sub)) => subscribe(client, sub, out)?,
        _ => bail!("Unknown command"),
    }
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    if let Err(e) = do_main(&matches) {
        let red_bold: fn(w: &str) -> String = if should_colorize(&matches) {
            |w| w.paint(Color::Red.bold()).to_string()
        } else {
            |w| w.to_string()
        };

        if matches.get_flag("debug") {
            eprintln!("{:?}", e);
        } else {
            eprintln!("{} {:#}", red_bold("Error:"), e);
        }
        std::process::exit(1);
    }
}
