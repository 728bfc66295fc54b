use crate::client::CliError;

pub async fn status() -> Result<(), CliError> {
    let pool = kitt_db::connect_from_env()
        .await
        .map_err(|e| CliError::remote(format!("{e:#}")))?;
    let s = kitt_db::status(&pool)
        .await
        .map_err(|e| CliError::remote(format!("{e:#}")))?;
    println!(
        "db_ok={} has_runs_table={} schema_version={}",
        s.ok, s.has_runs_table, s.schema_version
    );
    Ok(())
}

pub async fn migrate() -> Result<(), CliError> {
    let pool = kitt_db::connect_from_env()
        .await
        .map_err(|e| CliError::remote(format!("{e:#}")))?;
    kitt_db::migrate(&pool)
        .await
        .map_err(|e| CliError::remote(format!("{e:#}")))?;
    println!("migrations_applied=true");
    Ok(())
}
