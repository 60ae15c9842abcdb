use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use thesaurus_builder::io::open_reader;
use thesaurus_builder::{Error, Result};


// prints the nearest neighbours of query words from a finished run, the
// neighbours file holds `entry<TAB>neighbour<TAB>score` lines grouped by entry
// treated as binary executable so it can be ran independently from main

/// Looks up the nearest neighbours of words in a built thesaurus.
#[derive(Parser)]
#[command(name = "lookup", version, about)]
struct Args {
    /// The neighbours.strings.tsv file of a run
    neighbours: PathBuf,
    /// One query word per line
    queries: PathBuf,
    /// Neighbours shown per word
    #[arg(short, long, default_value_t = 10)]
    k: usize,
}

fn read_neighbours(path: &PathBuf) -> Result<HashMap<String, Vec<(String, f64)>>> {
    let mut neighbours: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    for (i, line) in open_reader(path)?.lines().enumerate() {
        let line = line.map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let fields: Vec<&str> = line.split('\t').collect();
        let (entry, neighbour, score) = match fields.as_slice() {
            [entry, neighbour, score] => (*entry, *neighbour, *score),
            _ => return Err(Error::format(format!("{}:{}", path.display(), i + 1), "expected three columns")),
        };
        let score: f64 = score
            .parse()
            .map_err(|_| Error::format(format!("{}:{}", path.display(), i + 1), format!("bad score {}", score)))?;
        neighbours.entry(entry.to_owned()).or_default().push((neighbour.to_owned(), score));
    }
    Ok(neighbours)
}

fn run_lookup(args: &Args) -> Result<()> {
    let neighbours = read_neighbours(&args.neighbours)?;
    info!("loaded neighbours of {} entries", neighbours.len());

    for query in open_reader(&args.queries)?.lines() {
        let query = query.map_err(|e| Error::io(format!("cannot read {}", args.queries.display()), e))?;
        let query = query.trim();
        if query.is_empty() {
            continue;
        }
        match neighbours.get(query) {
            Some(found) => {
                println!("searching {} most similar words to {}", args.k, query);
                for (i, (neighbour, score)) in found.iter().take(args.k).enumerate() {
                    println!("{} : {} ? {} = {}", i, query, neighbour, score);
                }
            }
            None => println!("{} has no neighbours in this thesaurus", query),
        }
        println!();
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
    match run_lookup(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
