#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    // load .env
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_filename("../.env");
    }

    cumo_lib::logging::init();

    if let Err(e) = cumo_lib::desktop::run() {
        tracing::error!("[main] Host failed: {:#}", e);
        std::process::exit(1);
    }
}
