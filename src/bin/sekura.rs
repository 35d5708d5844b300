//! Frontend: `add`/`delete` subcommands that talk to `sekurad`, and a
//! standalone interactive mode that drives the core directly.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use sekura::gateway::{Attachment, Gateway, HostedHost};
use sekura::protocol::{self, AddRequest, DeleteRequest, Request, Response};
use sekura::{Disk, Error, Partition};

#[derive(Debug, Parser)]
#[clap(name = "sekura")]
#[clap(about = "Plausibly deniable encrypted block store", long_about = None)]
struct Cli {
    /// Run the interactive frontend without a daemon
    #[clap(long)]
    standalone: bool,

    /// Disk to operate on (absolute path)
    #[clap(long)]
    disk: Option<PathBuf>,

    /// Passphrase; prompted on stdin when omitted
    #[clap(long)]
    password: Option<String>,

    /// Machine-readable output only; non-zero exit on error
    #[clap(long)]
    parsable: bool,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a partition and expose it as a block device
    Add,
    /// Destroy a partition
    Delete,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let parsable = cli.parsable;
    if let Err(e) = run(cli) {
        if parsable {
            eprintln!("{}", e);
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.standalone {
        return repl();
    }
    let command = cli.command.ok_or_else(|| anyhow!("nothing to do: pass a subcommand or --standalone"))?;
    let disk = cli.disk.ok_or_else(|| anyhow!("--disk is required"))?;
    if !disk.is_absolute() {
        bail!("--disk must be an absolute path");
    }
    let disk_path = disk.to_string_lossy().into_owned();
    let passphrase = match cli.password {
        Some(p) => p,
        None => prompt_stdin("Enter password: ")?,
    };

    match command {
        Command::Add => {
            let response = roundtrip(&Request::Add(AddRequest { disk_path, passphrase }))?;
            match response {
                Response::Add(r) => {
                    if !r.error.is_empty() {
                        bail!(r.error);
                    }
                    if cli.parsable {
                        println!("{}", r.device_path);
                    } else {
                        println!("Success! Partition mounted as {}.", r.device_path);
                    }
                }
                other => bail!("daemon answered the wrong request: {:?}", other),
            }
        }
        Command::Delete => {
            let response = roundtrip(&Request::Delete(DeleteRequest { disk_path, passphrase }))?;
            match response {
                Response::Delete(r) => {
                    if !r.error.is_empty() {
                        bail!(r.error);
                    }
                    if !cli.parsable {
                        println!("Success! Partition deleted.");
                    }
                }
                other => bail!("daemon answered the wrong request: {:?}", other),
            }
        }
    }
    Ok(())
}

fn roundtrip(request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(protocol::SOCKET_PATH)
        .with_context(|| format!("connecting to {} (is sekurad running?)", protocol::SOCKET_PATH))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    protocol::send(&mut writer, request)?;
    protocol::receive(&mut reader)?.ok_or_else(|| anyhow!("daemon closed the connection without responding"))
}

fn prompt_stdin(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        bail!("stdin closed");
    }
    Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

/// Parse a block size with an optional binary-unit suffix: `512`, `4K`,
/// `16M`, `1G`.
fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits.parse().with_context(|| format!("no size in {:?}", trimmed))?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        other => bail!("unknown size suffix {:?}", other),
    };
    value.checked_mul(multiplier).ok_or_else(|| anyhow!("size overflows"))
}

fn absolute(path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_absolute() { Ok(path) } else { Ok(std::env::current_dir()?.join(path)) }
}

struct Repl {
    disks: Vec<Disk>,
    gateway: Gateway<HostedHost>,
    attachments: Vec<Attachment>,
}

impl Repl {
    fn select_disk(&self, input: &str) -> Result<&Disk> {
        let num: usize = input.trim().parse().context("not a disk number")?;
        if num == 0 || num > self.disks.len() {
            bail!("invalid disk num");
        }
        Ok(&self.disks[num - 1])
    }

    fn mount(&mut self, partition: Partition) -> Result<()> {
        let attachment = self.gateway.expose(partition)?;
        println!("Success! Partition mounted as {}!", attachment.device_path().display());
        self.attachments.push(attachment);
        Ok(())
    }
}

/// Interactive standalone mode: manages its own disk list and gateway, no
/// daemon involved.
fn repl() -> Result<()> {
    let mut repl = Repl { disks: Vec::new(), gateway: Gateway::new(HostedHost::new()), attachments: Vec::new() };
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let Some(input) = ask(&mut lines, "> ")? else { break };
        match input.to_lowercase().as_str() {
            "" => {}
            "quit" | "q" => break,
            "adddisk" => {
                let Some(path) = ask(&mut lines, "Enter path: ")? else { break };
                match absolute(&path).and_then(|p| Disk::open(&p).map_err(Into::into)) {
                    Ok(disk) => {
                        repl.disks.push(disk);
                        println!("Success! Disk num {}.", repl.disks.len());
                    }
                    Err(e) => println!("Error opening disk: {}", e),
                }
            }
            "createdisk" => {
                let Some(path) = ask(&mut lines, "Enter path: ")? else { break };
                let Some(size) = ask(&mut lines, "Enter block size: ")? else { break };
                match create_disk(&mut lines, &path, &size)? {
                    Some(disk) => {
                        repl.disks.push(disk);
                        println!("Success! Disk num {}.", repl.disks.len());
                    }
                    None => {}
                }
            }
            "addpartition" => {
                let Some(num) = ask(&mut lines, "Enter disk num: ")? else { break };
                let disk = match repl.select_disk(&num) {
                    Ok(disk) => disk.clone(),
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let Some(password) = ask(&mut lines, "Enter password: ")? else { break };
                match disk.open_partition(&password) {
                    Ok(partition) => {
                        if let Err(e) = repl.mount(partition) {
                            println!("Error mounting partition: {}", e);
                        }
                    }
                    Err(e) => println!("Error opening partition: {}", e),
                }
            }
            "createpartition" => {
                let Some(num) = ask(&mut lines, "Enter disk num: ")? else { break };
                let disk = match repl.select_disk(&num) {
                    Ok(disk) => disk.clone(),
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let Some(password) = ask(&mut lines, "Enter password: ")? else { break };
                match disk.open_partition(&password) {
                    Err(Error::NoSuchPartition) => {}
                    Ok(_) | Err(Error::InvalidBlockStructure(_)) => {
                        println!("A partition with this password already exists!");
                        continue;
                    }
                    Err(e) => {
                        println!("Error probing for an existing partition: {}", e);
                        continue;
                    }
                }
                let Some(count) = ask(&mut lines, "Enter block count: ")? else { break };
                let count: u64 = match count.trim().parse() {
                    Ok(count) => count,
                    Err(e) => {
                        println!("Error parsing block count: {}", e);
                        continue;
                    }
                };
                match disk.create_partition(&password, count) {
                    Ok(partition) => {
                        if let Err(e) = repl.mount(partition) {
                            println!("Error mounting partition: {}", e);
                        }
                    }
                    Err(e) => println!("Error writing partition: {}", e),
                }
            }
            "delete" => {
                let Some(num) = ask(&mut lines, "Enter disk num: ")? else { break };
                let disk = match repl.select_disk(&num) {
                    Ok(disk) => disk.clone(),
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let Some(password) = ask(&mut lines, "Enter password: ")? else { break };
                let deleted = match disk.open_partition(&password) {
                    Ok(partition) => partition.delete(),
                    Err(Error::InvalidBlockStructure(unordered)) => unordered.delete(),
                    Err(e) => {
                        println!("Error opening partition: {}", e);
                        continue;
                    }
                };
                match deleted {
                    Ok(()) => println!("Success! Partition deleted."),
                    Err(e) => println!("Error deleting partition: {}", e),
                }
            }
            _ => println!("Unknown cmd"),
        }
    }
    Ok(())
}

fn create_disk(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    path: &str,
    size: &str,
) -> Result<Option<Disk>> {
    let path = match absolute(path) {
        Ok(path) => path,
        Err(e) => {
            println!("Error turning path into absolute path: {}", e);
            return Ok(None);
        }
    };
    let block_size = match parse_size(size) {
        Ok(size) => size,
        Err(e) => {
            println!("Error parsing byte size: {}", e);
            return Ok(None);
        }
    };
    let created = if path.exists() {
        // reuse the file as-is; the slot count falls out of its length
        match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Disk::create_in_file(file, block_size),
            Err(e) => {
                println!("Error opening disk: {}", e);
                return Ok(None);
            }
        }
    } else {
        let Some(count) = ask(lines, "Enter block count: ")? else { return Ok(None) };
        let count: u64 = match count.trim().parse() {
            Ok(count) => count,
            Err(e) => {
                println!("Error parsing block count: {}", e);
                return Ok(None);
            }
        };
        Disk::create_at(&path, block_size, count)
    };
    match created {
        Ok(disk) => Ok(Some(disk)),
        Err(e) => {
            println!("Error writing disk: {}", e);
            Ok(None)
        }
    }
}

fn ask(lines: &mut impl Iterator<Item = io::Result<String>>, message: &str) -> Result<Option<String>> {
    print!("{}", message);
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_string())),
        None => Ok(None),
    }
}
