use std::path::PathBuf;

use argh::FromArgs;
use hamq_primitives::params::ControllerConfig;

#[derive(Debug, Clone, FromArgs)]
#[argh(description = "HAMQ replica controller")]
pub struct Args {
    #[argh(option, short = 'c', description = "path to configuration")]
    pub config: Option<PathBuf>,

    // Config overriding args
    #[argh(option, description = "rpc listen address")]
    pub listen_address: Option<String>,

    #[argh(option, short = 'd', description = "datadir path for the event log")]
    pub datadir: Option<PathBuf>,
}

impl Args {
    pub fn override_config(&self, config: &mut ControllerConfig) {
        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(datadir) = &self.datadir {
            config.datadir = datadir.clone();
        }
    }
}
