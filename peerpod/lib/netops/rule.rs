use std::net::IpAddr;

use futures::TryStreamExt;
use getset::Getters;
use ipnetwork::Ipv4Network;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::IpVersion;
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::{PeerpodError, PeerpodResult};

use super::Namespace;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An IPv4 routing-policy rule that looks up a table.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Rule {
    /// The rule priority.
    priority: u32,

    /// The table looked up when the rule matches.
    table: u32,

    /// Only packets from this prefix.
    #[builder(default, setter(strip_option))]
    src: Option<Ipv4Network>,

    /// Only packets arriving on this interface.
    #[builder(default, setter(strip_option, into))]
    iif: Option<String>,
}

/// Selects rules by source, input interface and priority. Unset fields match anything.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct RuleFilter {
    /// Match the source prefix.
    #[builder(default, setter(strip_option))]
    pub src: Option<Ipv4Network>,

    /// Match the input interface.
    #[builder(default, setter(strip_option, into))]
    pub iif: Option<String>,

    /// Match the priority.
    #[builder(default, setter(strip_option))]
    pub priority: Option<u32>,

    /// Match the table.
    #[builder(default, setter(strip_option))]
    pub table: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuleFilter {
    fn matches(&self, rule: &Rule) -> bool {
        (self.src.is_none() || self.src == rule.src)
            && (self.iif.is_none() || self.iif == rule.iif)
            && (self.priority.is_none() || self.priority == Some(rule.priority))
            && (self.table.is_none() || self.table == Some(rule.table))
    }
}

impl Namespace {
    /// Adds a rule.
    pub async fn rule_add(&self, rule: &Rule) -> PeerpodResult<()> {
        let mut request = self
            .handle()
            .rule()
            .add()
            .v4()
            .table_id(rule.table)
            .priority(rule.priority)
            .action(RuleAction::ToTable);

        if let Some(iif) = &rule.iif {
            request = request.input_interface(iif.clone());
        }
        if let Some(src) = rule.src {
            request = request.source_prefix(src.network(), src.prefix());
        }

        request.execute().await?;
        debug!(?rule, ns = %self.path().display(), "added rule");
        Ok(())
    }

    /// Deletes every rule matching the filter and returns how many were deleted.
    ///
    /// Fails with `NotFound` if nothing matched.
    pub async fn rule_del(&self, filter: &RuleFilter) -> PeerpodResult<usize> {
        let messages: Vec<RuleMessage> = self
            .rule_messages()
            .await?
            .into_iter()
            .filter(|message| filter.matches(&rule_from_message(message)))
            .collect();

        if messages.is_empty() {
            return Err(PeerpodError::NotFound(format!(
                "no rule matching {filter:?} in {}",
                self.path().display()
            )));
        }

        let count = messages.len();
        for message in messages {
            self.handle().rule().del(message).execute().await?;
        }

        debug!(?filter, count, "deleted rules");
        Ok(count)
    }

    /// Lists IPv4 rules matching the filter.
    pub async fn rule_list(&self, filter: &RuleFilter) -> PeerpodResult<Vec<Rule>> {
        Ok(self
            .rule_messages()
            .await?
            .iter()
            .map(rule_from_message)
            .filter(|rule| filter.matches(rule))
            .collect())
    }

    async fn rule_messages(&self) -> PeerpodResult<Vec<RuleMessage>> {
        let mut messages = self.handle().rule().get(IpVersion::V4).execute();
        let mut result = Vec::new();
        while let Some(message) = messages.try_next().await? {
            result.push(message);
        }

        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn rule_from_message(message: &RuleMessage) -> Rule {
    let mut rule = Rule {
        priority: 0,
        table: u32::from(message.header.table),
        src: None,
        iif: None,
    };

    for attribute in &message.attributes {
        match attribute {
            RuleAttribute::Priority(priority) => rule.priority = *priority,
            RuleAttribute::Table(table) => rule.table = *table,
            RuleAttribute::Iifname(name) => rule.iif = Some(name.clone()),
            RuleAttribute::Source(IpAddr::V4(ip)) => {
                rule.src = Ipv4Network::new(*ip, message.header.src_len).ok()
            }
            _ => {}
        }
    }

    rule
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
