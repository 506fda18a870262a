fn main() -> anyhow::Result<()> {
    mercount::cli::run::entry()
}
