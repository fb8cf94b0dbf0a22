//! The invocation driver.
//!
//! A build script parses its process arguments into [`Args`] (or constructs
//! them directly) and hands them to [`Build::finish`]. Exactly one mode
//! runs per invocation: one of the three inspection printers, or execution.

use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use clap::Parser;
use color_eyre::{Result, eyre::bail};
use tracing::error;

use crate::{
    graph,
    log::LogLevel,
    registry::Build,
    rule::Job,
    sched::{Pool, PoolOptions},
    uri::Uri,
};

/// The command-line surface a build script exposes.
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Programmable build engine")]
pub struct Args {
    /// Targets to build.
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Warning)]
    pub log: LogLevel,

    /// Number of parallel jobs.
    #[arg(short = 'j', long, default_value_t = 1, value_parser = positive_usize)]
    pub jobs: usize,

    /// Number of serial jobs allowed to run at once.
    #[arg(long, default_value_t = 1, value_parser = positive_usize)]
    pub n_serial: usize,

    /// Hold off starting new jobs while others run and the 1-minute load
    /// average is above this value.
    #[arg(short = 'l', long, default_value_t = f64::INFINITY, value_parser = positive_f64)]
    pub load_average: f64,

    /// Keep going on unrelated jobs even if some jobs fail.
    #[arg(short = 'k', long)]
    pub keep_going: bool,

    /// Print descriptions, then exit.
    #[arg(short = 'D', long)]
    pub descriptions: bool,

    /// Print dependencies, then exit.
    #[arg(short = 'P', long)]
    pub dependencies: bool,

    /// Print dependencies in DOT format, then exit.
    #[arg(short = 'Q', long)]
    pub dependencies_dot: bool,

    /// Print what would run without running it.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

impl Default for Args {
    /// The same defaults the command line applies.
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            log: LogLevel::Warning,
            jobs: 1,
            n_serial: 1,
            load_average: f64::INFINITY,
            keep_going: false,
            descriptions: false,
            dependencies: false,
            dependencies_dot: false,
            dry_run: false,
        }
    }
}

impl Args {
    fn requested_targets(&self) -> Vec<&str> {
        if self.targets.is_empty() {
            vec!["all"]
        } else {
            self.targets.iter().map(String::as_str).collect()
        }
    }
}

fn positive_usize(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err("must be greater than zero".to_owned()),
        Err(err) => Err(err.to_string()),
    }
}

fn positive_f64(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(x) if x > 0.0 => Ok(x),
        Ok(_) => Err("must be greater than zero".to_owned()),
        Err(err) => Err(err.to_string()),
    }
}

impl Build {
    /// Parse the process arguments, set up logging, and run the build.
    pub async fn main(&self) -> Result<()> {
        let args = Args::parse();
        crate::log::init(args.log);
        self.finish(&args).await
    }

    /// Run the build under an already-parsed invocation. Call at most once.
    pub async fn finish(&self, args: &Args) -> Result<()> {
        self.collect_phonies()?;

        if args.descriptions {
            print!("{}", render_descriptions(&self.bindings()));
            return Ok(());
        }
        if args.dependencies {
            print!("{}", render_dependencies(&self.distinct_jobs()));
            return Ok(());
        }
        if args.dependencies_dot {
            print!("{}", render_dot(&self.distinct_jobs()));
            return Ok(());
        }

        let targets = args
            .requested_targets()
            .into_iter()
            .map(Uri::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let mut graph = graph::build(self, &targets)?;
        let leaves = std::mem::take(&mut graph.leaves);
        let pool = Pool::new(
            self.clone(),
            &mut graph,
            PoolOptions {
                jobs: args.jobs,
                n_serial: args.n_serial,
                load_average: args.load_average,
                keep_going: args.keep_going,
                dry_run: args.dry_run,
            },
        );

        let deferred = pool.run(leaves).await?;
        if deferred.is_empty() {
            return Ok(());
        }
        error!("errors during execution");
        for (job, err) in &deferred {
            error!(%job, "{err:?}");
        }
        bail!("execution failed: {} deferred error(s)", deferred.len());
    }
}

/// Every target, with its rule's description lines indented underneath.
fn render_descriptions(bindings: &[(Uri, Arc<Job>)]) -> String {
    let mut out = String::new();
    for (target, job) in bindings {
        let _ = writeln!(out, "{target}");
        for desc in job.descs() {
            for line in desc.split('\t') {
                let _ = writeln!(out, "\t{line}");
            }
        }
    }
    out
}

/// Each rule's targets and dependencies, blank-line separated.
fn render_dependencies(jobs: &[Arc<Job>]) -> String {
    let mut out = String::new();
    for job in jobs {
        job.render(&mut out);
        out.push('\n');
    }
    out
}

/// The graph in DOT: a circular action node per rule, its targets pointing
/// in and clustered together, its dependencies pointed out to.
fn render_dot(jobs: &[Arc<Job>]) -> String {
    let mut out = String::from("digraph G{\n");
    let mut node_of: HashMap<&Uri, String> = HashMap::new();
    let mut nodes = 0usize;
    let mut clusters = 0usize;
    for job in jobs {
        nodes += 1;
        clusters += 1;
        let action_node = format!("n{nodes}");
        let _ = writeln!(out, "{action_node}[label=\"○\"]");

        for target in job.targets() {
            let node = name_node(&mut node_of, &mut nodes, target);
            let _ = writeln!(out, "{node}[label={}]", escape(target));
            let _ = writeln!(out, "{node} -> {action_node}");
        }

        let _ = writeln!(out, "subgraph cluster_{clusters}{{");
        for target in job.targets() {
            let _ = writeln!(out, "{}", node_of[target]);
        }
        out.push_str("}\n");

        for dep in job.deps() {
            let node = name_node(&mut node_of, &mut nodes, dep);
            let _ = writeln!(out, "{node}[label={}]", escape(dep));
            let _ = writeln!(out, "{action_node} -> {node}");
        }
    }
    out.push_str("}\n");
    out
}

fn name_node<'a>(
    node_of: &mut HashMap<&'a Uri, String>,
    nodes: &mut usize,
    name: &'a Uri,
) -> String {
    node_of
        .entry(name)
        .or_insert_with(|| {
            *nodes += 1;
            format!("n{nodes}")
        })
        .clone()
}

fn escape(name: &Uri) -> String {
    format!("\"{}\"", name.as_str().replace('"', "\\\""))
}
