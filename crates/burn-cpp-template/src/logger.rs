use log::{LevelFilter, SetLoggerError};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{runtime::ConfigErrors, Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

/// Errors raised while installing the logger.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("Invalid logger configuration: {0}")]
    Config(#[from] ConfigErrors),

    #[error("Logger already set: {0}")]
    SetLogger(#[from] SetLoggerError),
}

/// Log to stderr, stdout being reserved for the generated source.
pub fn init_log(level: LevelFilter) -> Result<(), LogError> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("[{h({l})} - {f}:{L}] {m}{n}")))
        .build();
    let appender = Appender::builder().build("stderr", Box::new(stderr));

    log4rs::init_config(
        Config::builder()
            .appender(appender)
            .build(Root::builder().appender("stderr").build(level))?,
    )?;
    update_panic_hook();

    Ok(())
}

fn update_panic_hook() {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        hook(info);
    }));
}
