use crate::report::{ClientResult, Totals, ValidationCheck, ValidationSummary};

pub fn run_validations(clients: &[ClientResult], totals: &Totals) -> ValidationSummary {
    let mut checks = Vec::new();

    checks.push(ValidationCheck {
        name: "holder_bound".to_string(),
        passed: totals.peak_holders <= totals.holder_limit,
        details: format!(
            "peak of {} simultaneous holders (limit {})",
            totals.peak_holders, totals.holder_limit
        ),
    });

    checks.push(ValidationCheck {
        name: "all_grants_completed".to_string(),
        passed: totals.grants == totals.planned_grants,
        details: format!("{}/{} grants completed", totals.grants, totals.planned_grants),
    });

    let failing = failing_clients(clients);
    checks.push(ValidationCheck {
        name: "no_errors".to_string(),
        passed: totals.total_errors == 0,
        details: if failing.is_empty() {
            "No acquisition or release errors".to_string()
        } else {
            format!(
                "{} errors ({} timeouts) on clients {failing}",
                totals.total_errors, totals.timeout_errors
            )
        },
    });

    let passed = checks.iter().all(|check| check.passed);
    ValidationSummary { passed, checks }
}

fn failing_clients(clients: &[ClientResult]) -> String {
    clients
        .iter()
        .filter(|client| !client.errors.is_empty())
        .map(|client| client.owner_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorCategory;

    fn totals(peak_holders: usize, grants: usize, total_errors: usize) -> Totals {
        Totals {
            planned_grants: 4,
            grants,
            holder_limit: 1,
            peak_holders,
            total_errors,
            timeout_errors: 0,
        }
    }

    #[test]
    fn clean_run_passes() {
        let clients = vec![ClientResult::new(0, "client-0".into())];
        let summary = run_validations(&clients, &totals(1, 4, 0));
        assert!(summary.passed);
        assert_eq!(summary.checks.len(), 3);
    }

    #[test]
    fn exceeded_bound_fails() {
        let summary = run_validations(&[], &totals(2, 4, 0));
        assert!(!summary.passed);
        assert!(!summary.checks[0].passed);
    }

    #[test]
    fn errors_name_the_client() {
        let mut client = ClientResult::new(3, "client-3".into());
        client.record_error(ErrorCategory::Release, 0, "boom");
        let summary = run_validations(&[client], &totals(1, 4, 1));
        assert!(!summary.passed);
        assert!(summary.checks[2].details.contains("client-3"));
    }
}
