use anyhow::{Context, Result};
use serialport::{DataBits, Parity, StopBits};
use std::io::{BufRead, Write};
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

use lcp_proto::link::{Link, LinkHandle};
use lcp_proto::transport::{StreamTransport, BAUD_RATE};
use lcp_proto::LinkConfig;

fn cmd_set(args: &mut CmdScanner, link: &LinkHandle) -> Result<()> {
    let index = args.parse_next::<u8>()?;
    let state = args.parse_next::<u8>()? != 0;
    link.set_point(index, state)?;
    Ok(())
}

fn cmd_show(link: &LinkHandle) {
    let status = link.status();
    println!("state:   {:?} (last failure: {:?})", status.state, status.cause);
    println!("healthy: {}", status.healthy);
    println!("local:   {:?}", status.local.iter_set().collect::<Vec<_>>());
    println!("remote:  {:?}", status.remote.iter_set().collect::<Vec<_>>());
    println!("{:?}", status.stats);
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let options: Vec<String> = args.collect();
    let config = LinkConfig::from_options(&options.join(" "))?;

    let serial = serialport::new(&port, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::Even)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_millis(50))
        .open()
        .with_context(|| format!("Failed to open serial port {}", port))?;

    let mut link = Link::new(StreamTransport::new(serial), config)?;
    let handle = link.handle();
    let runner = std::thread::spawn(move || {
        link.run(|event| println!("<< {:?}", event))
    });

    let mut stdout = std::io::stdout();
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut cmd = String::new();
        if !read_command(&mut std::io::stdin().lock(), &mut cmd)? {
            println!();
            break;
        }
        let mut scan = CmdScanner::new(&cmd);
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("set") | Ok("s") => cmd_set(&mut scan, &handle),
            Ok("show") => {
                cmd_show(&handle);
                Ok(())
            }
            Ok("reset") => handle.reset().map_err(Into::into),
            Ok("quit") | Ok("q") => break,
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:?}", err)
        }
    }

    handle.close()?;
    runner
        .join()
        .map_err(|_| anyhow::anyhow!("Link thread panicked"))??;
    Ok(())
}

/// Read one line into `buf`. Returns false at end of input.
fn read_command(input: &mut impl BufRead, buf: &mut String) -> Result<bool> {
    buf.clear();
    Ok(input.read_line(buf)? > 0)
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            splt: line.split_whitespace().peekable(),
        }
    }
    fn next(&mut self) -> Result<&str> {
        self.splt.next().context("End of stream")
    }
    fn parse_next<T: FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }
}
