fn main() -> anyhow::Result<()> {
    verdict::run()?;
    Ok(())
}
