use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::partitionworkload_types::{
    PartitionWorkloadCondition, PartitionWorkloadConditionType, PartitionWorkloadStatus,
};

/// Inserts or updates the condition of the given type, keeping at most one
/// entry per type. Re-asserting an identical (status, reason) pair is a
/// no-op so timestamps do not churn; a status flip replaces the entry and
/// stamps a fresh transition time unless the caller supplied one.
pub fn set_condition(status: &mut PartitionWorkloadStatus, mut condition: PartitionWorkloadCondition) {
    if let Some(current) = get_condition(status, condition.type_) {
        if current.status == condition.status && current.reason == condition.reason {
            return;
        }
        if current.status == condition.status {
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }
    if condition.last_transition_time.is_none() {
        condition.last_transition_time = Some(Time(Utc::now()));
    }
    status.conditions.retain(|c| c.type_ != condition.type_);
    status.conditions.push(condition);
}

pub fn get_condition(
    status: &PartitionWorkloadStatus,
    cond_type: PartitionWorkloadConditionType,
) -> Option<&PartitionWorkloadCondition> {
    status.conditions.iter().find(|c| c.type_ == cond_type)
}

/// Condition raised when pod creation or deletion fails during a sync.
pub fn failed_scale_condition(message: &str) -> PartitionWorkloadCondition {
    let now = Time(Utc::now());
    PartitionWorkloadCondition {
        type_: PartitionWorkloadConditionType::FailedScale,
        status: "True".to_string(),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: "FailedScale".to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cond(status: &str, reason: &str, stamp: i64) -> PartitionWorkloadCondition {
        PartitionWorkloadCondition {
            type_: PartitionWorkloadConditionType::FailedScale,
            status: status.to_string(),
            last_update_time: None,
            last_transition_time: Some(Time(Utc.timestamp_opt(stamp, 0).unwrap())),
            reason: reason.to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn set_keeps_one_entry_per_type() {
        let mut status = PartitionWorkloadStatus::default();
        set_condition(&mut status, cond("True", "FailedScale", 1));
        set_condition(&mut status, cond("False", "Recovered", 2));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "False");
    }

    #[test]
    fn set_is_idempotent_for_same_status_and_reason() {
        let mut status = PartitionWorkloadStatus::default();
        set_condition(&mut status, cond("True", "FailedScale", 1));
        set_condition(&mut status, cond("True", "FailedScale", 99));
        let stored = get_condition(&status, PartitionWorkloadConditionType::FailedScale).unwrap();
        assert_eq!(
            stored.last_transition_time,
            Some(Time(Utc.timestamp_opt(1, 0).unwrap()))
        );
    }

    #[test]
    fn reason_change_preserves_transition_time() {
        let mut status = PartitionWorkloadStatus::default();
        set_condition(&mut status, cond("True", "FailedScale", 1));
        set_condition(&mut status, cond("True", "StillFailing", 7));
        let stored = get_condition(&status, PartitionWorkloadConditionType::FailedScale).unwrap();
        assert_eq!(stored.reason, "StillFailing");
        assert_eq!(
            stored.last_transition_time,
            Some(Time(Utc.timestamp_opt(1, 0).unwrap()))
        );
    }

    #[test]
    fn status_change_takes_supplied_transition_time() {
        let mut status = PartitionWorkloadStatus::default();
        set_condition(&mut status, cond("True", "FailedScale", 1));
        set_condition(&mut status, cond("False", "Recovered", 42));
        let stored = get_condition(&status, PartitionWorkloadConditionType::FailedScale).unwrap();
        assert_eq!(
            stored.last_transition_time,
            Some(Time(Utc.timestamp_opt(42, 0).unwrap()))
        );
    }

    #[test]
    fn status_change_without_timestamp_stamps_now() {
        let mut status = PartitionWorkloadStatus::default();
        set_condition(&mut status, cond("True", "FailedScale", 1));
        let mut flipped = cond("False", "Recovered", 0);
        flipped.last_transition_time = None;
        set_condition(&mut status, flipped);
        let stored = get_condition(&status, PartitionWorkloadConditionType::FailedScale).unwrap();
        assert!(stored.last_transition_time.is_some());
    }
}
