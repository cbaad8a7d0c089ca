//! Remote collaborators: the rule configuration service and the audit reporting service.

pub mod report;
pub mod rules;

pub use report::{DispatchReport, HttpReportSink, LogReportSink, ReportingSink};
pub use rules::{HttpRuleSource, RuleSource, RuleStore, spawn_rule_refresher};
