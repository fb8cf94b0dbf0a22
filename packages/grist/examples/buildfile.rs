//! A small build script embedding the engine.
//!
//! Try:
//!
//! ```text
//! cargo run --example buildfile -- -P
//! cargo run --example buildfile -- greeting.txt -j 2
//! cargo run --example buildfile -- -D
//! ```

use color_eyre::Result;
use grist::{Build, FileOpts, PhonyOpts};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let build = Build::new();

    build.phony(
        "all",
        ["greeting.txt"],
        PhonyOpts::builder().desc("The default target").build(),
    )?;

    build.file(
        ["name.txt"],
        Vec::<&str>::new(),
        FileOpts::builder().desc("Who to greet").build(),
        |job| async move {
            tokio::fs::write(job.targets()[0].path(), "world\n").await?;
            Ok(())
        },
    )?;

    build.file(
        ["greeting.txt"],
        ["name.txt"],
        FileOpts::builder().desc("Assemble the greeting").build(),
        |job| async move {
            let name = tokio::fs::read_to_string(job.deps()[0].path()).await?;
            let greeting = format!("hello, {}!\n", name.trim());
            tokio::fs::write(job.targets()[0].path(), greeting).await?;
            Ok(())
        },
    )?;

    build.main().await
}
