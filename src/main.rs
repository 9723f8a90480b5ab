fn main() -> anyhow::Result<()> {
    prepai_lib::run()
}
