fn main() -> anyhow::Result<()> {
    resticvault::cli::run()
}
