use std::path::PathBuf;

use argh::FromArgs;
use hamq_primitives::params::BrokerConfig;

#[derive(Debug, Clone, FromArgs)]
#[argh(description = "HAMQ broker replica")]
pub struct Args {
    #[argh(option, short = 'c', description = "path to configuration")]
    pub config: Option<PathBuf>,

    // Config overriding args
    #[argh(option, description = "broker name (replica group)")]
    pub broker_name: Option<String>,

    #[argh(option, description = "broker address")]
    pub broker_address: Option<String>,

    #[argh(option, description = "replication listen address")]
    pub ha_listen_address: Option<String>,

    #[argh(option, description = "controller addresses, ';'-separated")]
    pub controller_addrs: Option<String>,

    #[argh(option, short = 'd', description = "datadir path for local state")]
    pub datadir: Option<PathBuf>,
}

impl Args {
    pub fn override_config(&self, config: &mut BrokerConfig) {
        if let Some(broker_name) = &self.broker_name {
            config.broker_name = broker_name.clone();
        }
        if let Some(broker_address) = &self.broker_address {
            config.broker_address = broker_address.clone();
        }
        if let Some(ha_listen_address) = &self.ha_listen_address {
            config.ha_listen_address = ha_listen_address.clone();
        }
        if let Some(raw) = &self.controller_addrs {
            config.controller_addrs = BrokerConfig::parse_controller_addrs(raw);
        }
        if let Some(datadir) = &self.datadir {
            config.datadir = datadir.clone();
        }
    }
}
