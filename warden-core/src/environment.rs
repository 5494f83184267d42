use std::cell::RefCell;
use std::rc::Rc;

use warden_config::Config;

use crate::ban::{BanStore, IpsetDriver, NftDriver};
use crate::counter::CounterRegistry;
use crate::dnat::MappingCache;
use crate::mail::MailComposer;
use crate::report::ReportAggregator;

/// Everything a Step may need besides the entry it is given, bundled once
/// at startup and handed to every Step at construction time instead of
/// living behind ambient mutable singletons. Interior mutability is still
/// required because many Steps share the same registries across one
/// single traversal thread.
#[derive(Clone)]
pub struct Environment {
    pub counters: Rc<RefCell<CounterRegistry>>,
    pub mappings: Rc<RefCell<MappingCache>>,
    pub nft_bans: Rc<RefCell<BanStore<NftDriver>>>,
    pub ipset_bans: Rc<RefCell<BanStore<IpsetDriver>>>,
    pub report: Rc<RefCell<ReportAggregator>>,
    pub mail: MailComposer,
    pub email_from: String,
    pub email_to: Vec<String>,
    pub email_subject: String,
    pub eight_bit_encoding: String,
}

impl Environment {
    pub fn from_config(config: &Config) -> Self {
        let nft_driver = NftDriver {
            argv: config.nft_ban.nft.clone(),
        };
        let ipset_driver = IpsetDriver {
            argv: config.ipset_ban.ipset.clone(),
        };
        Environment {
            counters: Rc::new(RefCell::new(CounterRegistry::new())),
            mappings: Rc::new(RefCell::new(MappingCache::new())),
            nft_bans: Rc::new(RefCell::new(BanStore::new(
                config.ban_state_path("nftBan"),
                nft_driver,
            ))),
            ipset_bans: Rc::new(RefCell::new(BanStore::new(
                config.ban_state_path("ipsetBan"),
                ipset_driver,
            ))),
            report: Rc::new(RefCell::new(ReportAggregator::new(
                config.report_journal_path(),
            ))),
            mail: MailComposer::new(config.email.sendmail.clone()),
            email_from: config.email.from.clone(),
            email_to: config.email.to.clone(),
            email_subject: config.email.subject.clone(),
            eight_bit_encoding: config.eight_bit_encoding.clone(),
        }
    }
}
