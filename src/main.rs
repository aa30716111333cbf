use std::io::{self, BufRead, Write};

use anyhow::Context;
use clap::Parser;
use log::error;

use jack_link::{JackLink, DEFAULT_QUANTUM, DEFAULT_TEMPO, NAME, VERSION};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Bridge the JACK transport and an Ableton Link session.",
    long_about = "Keeps the JACK transport and an Ableton Link session in agreement:\n\
    tempo, bar position and play state flow in both directions, and the\n\
    bridge acts as the JACK timebase master while doing so."
)]
struct Cli {
    /// Initial tempo in beats per minute
    #[arg(short, long, value_name = "BPM", default_value_t = DEFAULT_TEMPO)]
    tempo: f64,

    /// Bar length in beats (the Link quantum)
    #[arg(short, long, value_name = "BEATS", default_value_t = DEFAULT_QUANTUM)]
    quantum: f64,

    /// JACK client name
    #[arg(short, long, value_name = "NAME", default_value = NAME)]
    name: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut app = JackLink::start(&cli.name, cli.tempo, cli.quantum.max(1.0))
        .with_context(|| format!("could not open JACK client '{}'", cli.name))?;

    println!("{NAME} v{VERSION}");
    println!("commands: tempo <bpm> | start | stop | status | quit");

    let stdin = io::stdin();
    while app.active() {
        print!("{NAME}> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let mut words = line.split_whitespace();
        match words.next() {
            None => {}
            Some("tempo") => match words.next().map(str::parse::<f64>) {
                Some(Ok(bpm)) if bpm > 0.0 => app.engine().request_tempo(bpm),
                _ => println!("usage: tempo <bpm>"),
            },
            Some("start" | "play") => app.engine().request_playing(true),
            Some("stop") => app.engine().request_playing(false),
            Some("status") => {
                let engine = app.engine();
                println!(
                    "tempo {:.2} bpm, quantum {:.0}, {} peer(s), {}",
                    engine.tempo(),
                    engine.quantum(),
                    engine.num_peers(),
                    if engine.playing() { "playing" } else { "stopped" },
                );
            }
            Some("quit" | "exit") => break,
            Some(other) => {
                error!("unknown command: {other}");
            }
        }
    }

    app.close();
    Ok(())
}
