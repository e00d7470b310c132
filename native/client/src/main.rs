use std::env;
use std::io::{stdin, BufRead, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use client::{data_dir_for, poll_inbox, register, send_message, DirectoryClient, FileStore};
use nom::bytes::complete::tag;
use nom::character::complete::{alphanumeric1, multispace1};
use nom::sequence::preceded;
use nom::IResult;
use protocol::{Config, SessionManager};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Command {
    to: String,
    msg: String,
}

fn parse_command(input: &str) -> IResult<&str, Command> {
    let (input, _) = preceded(tag("message"), multispace1)(input)?;
    let (input, name) = alphanumeric1(input)?;
    let (message, _spaces) = multispace1(input)?;
    Ok((
        "",
        Command {
            to: name.to_owned(),
            msg: message.to_owned(),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = env::args().collect::<Vec<String>>();
    let name = args.get(1).expect("usage: client NAME [DIRECTORY_URL]").to_owned();
    let addr = args
        .get(2)
        .map(|addr| addr.to_owned())
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_owned());

    eprintln!("Registering {name} against directory {addr}");

    let store = FileStore::open(data_dir_for(&name)?)?;
    let sessions = Arc::new(SessionManager::new(store, Config::default()));
    let directory = Arc::new(DirectoryClient::new(addr));

    register(&directory, &sessions, &name).await?;
    eprintln!("Registered: {name}!");
    println!("message NAME TEXT");

    let (cli_tx, mut cli_rx) = mpsc::unbounded_channel::<Command>();
    thread::spawn(move || {
        let lines = BufReader::new(stdin()).lines();
        for line in lines {
            let line = match line {
                Ok(line) => line,
                Err(_) => return,
            };
            match parse_command(&line) {
                Ok((_, command)) => {
                    if cli_tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => eprintln!("Invalid command: {e}"),
            }
        }
    });

    let mut inbox_poll = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            command = cli_rx.recv() => {
                match command {
                    Some(command) => {
                        if let Err(e) = send_message(&directory, &sessions, &name, &command.to, command.msg.as_bytes()).await {
                            eprintln!("Failed to message {}: {e}", command.to);
                        } else {
                            println!("Message Sent!");
                        }
                    }
                    None => {
                        eprintln!("Closing...");
                        return Ok(());
                    }
                }
            }
            _ = inbox_poll.tick() => {
                match poll_inbox(&directory, &sessions, &name).await {
                    Ok(messages) => {
                        for (sender, plaintext) in messages {
                            println!("{sender}: {}", String::from_utf8_lossy(&plaintext));
                        }
                    }
                    Err(e) => eprintln!("Failed to poll inbox: {e}"),
                }
            }
        }
    }
}
