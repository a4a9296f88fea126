mod cli;
mod commands;
mod env_loader;
mod error;
mod logging;
mod shift;
mod store;

fn main() {
    env_loader::load_dotenv();
    logging::init();

    match cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            match error::code_for(&err) {
                Some(code) => eprintln!("error[{}]: {err:#}", code.as_str()),
                None => eprintln!("error: {err:#}"),
            }
            std::process::exit(error::exit_code_for(&err));
        }
    }
}
