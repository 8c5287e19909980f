use anyhow::Result;

fn main() -> Result<()> {
    testbox::cli::run()
}
