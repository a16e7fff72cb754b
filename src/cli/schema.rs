use super::CliContext;
use changefeed::schema::write_schema;

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    let out_dir = context.root.join("schemas");
    for name in write_schema(&out_dir)? {
        println!("wrote {name}");
    }
    println!("Schemas written to {}", out_dir.display());
    Ok(())
}
