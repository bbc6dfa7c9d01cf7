use crate::commands::{build_runtime, load_config, open_database, CommandResult};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        match open_database("migrate", &config).await {
            Ok(pool) => {
                pool.close().await;
                CommandResult::success("migrate", "applied pending migrations")
            }
            Err(failure) => failure,
        }
    })
}
