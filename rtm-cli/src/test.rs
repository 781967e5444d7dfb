use serde_json::json;

use super::*;

fn parse(args: &[&str]) -> clap::error::Result<ArgMatches> {
    let mut argv = vec!["rtm", "--endpoint", "ws://localhost:1", "--appkey", "key"];
    argv.extend_from_slice(args);
    cli().try_get_matches_from(argv)
}

#[test]
fn test_cli_definition() {
    cli().debug_assert();
}

#[test]
fn test_message_is_json_or_string() {
    assert_eq!(parse_message(r#"{"who": "zebra"}"#), json!({"who": "zebra"}));
    assert_eq!(parse_message("42"), json!(42));
    assert_eq!(parse_message("hello world"), json!("hello world"));
    assert_eq!(parse_message(""), json!(""));
}

#[test]
fn test_subscribe_arguments() {
    let matches = parse(&[
        "--timeout", "3", "subscribe", "zoo", "--filter", "select * from animals", "-n", "5",
    ])
    .unwrap();
    assert_eq!(matches.get_one::<u64>("timeout"), Some(&3));
    let (name, sub) = matches.subcommand().unwrap();
    assert_eq!(name, "subscribe");
    assert_eq!(sub.get_one::<String>("CHANNEL").unwrap(), "zoo");
    assert_eq!(
        sub.get_one::<String>("filter").unwrap(),
        "select * from animals"
    );
    assert_eq!(sub.get_one::<u64>("count"), Some(&5));
    assert_eq!(sub.get_one::<u64>("duration"), None);
}

#[test]
fn test_publish_needs_a_message() {
    assert!(parse(&["publish", "animals"]).is_err());
    assert!(parse(&["publish", "animals", "{}"]).is_ok());
    assert!(parse(&["--color", "sometimes", "delete", "animals"]).is_err());
}

#[test]
fn test_color_flag() {
    let matches = parse(&["--color", "off", "delete", "animals"]).unwrap();
    assert!(!should_colorize(&matches));
    let matches = parse(&["--color", "on", "delete", "animals"]).unwrap();
    assert!(should_colorize(&matches));
}

#[test]
fn test_printer_formats_json() {
    let out = Printer::new(false);
    out.print(&json!({"who": "zebra", "where": [1, 2]})).unwrap();
    let text = out
        .cf
        .clone()
        .to_colored_json(&json!({"n": 1}), out.mode)
        .unwrap();
    assert!(text.contains("\"n\": 1"));
}
