//! Prometheus text exposition format.
//!
//! Renders per-tier autoscaling state into the Prometheus text exposition
//! format for scraping by a Prometheus server or compatible agent.

/// Point-in-time view of one tier, assembled by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TierReport {
    pub tier: String,
    /// Mean utilization; `None` when the collector has no data.
    pub utilization: Option<f64>,
    pub ready_instances: u32,
    /// Last replica count the autoscaler commanded, if any.
    pub commanded: Option<u32>,
}

/// Render tier reports into Prometheus text format.
///
/// Tiers without data or without a commanded count are omitted from the
/// corresponding gauge rather than reported as zero.
pub fn render_prometheus(reports: &[TierReport]) -> String {
    let mut out = String::new();

    out.push_str("# HELP tierscale_utilization_ratio Mean utilization over Ready instances.\n");
    out.push_str("# TYPE tierscale_utilization_ratio gauge\n");
    for r in reports {
        if let Some(u) = r.utilization {
            out.push_str(&format!(
                "tierscale_utilization_ratio{{tier=\"{}\"}} {:.4}\n",
                r.tier, u
            ));
        }
    }

    out.push_str("# HELP tierscale_ready_instances Number of Ready instances.\n");
    out.push_str("# TYPE tierscale_ready_instances gauge\n");
    for r in reports {
        out.push_str(&format!(
            "tierscale_ready_instances{{tier=\"{}\"}} {}\n",
            r.tier, r.ready_instances
        ));
    }

    out.push_str("# HELP tierscale_commanded_replicas Replica count last commanded by the autoscaler.\n");
    out.push_str("# TYPE tierscale_commanded_replicas gauge\n");
    for r in reports {
        if let Some(c) = r.commanded {
            out.push_str(&format!(
                "tierscale_commanded_replicas{{tier=\"{}\"}} {}\n",
                r.tier, c
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(tier: &str, utilization: Option<f64>) -> TierReport {
        TierReport {
            tier: tier.to_string(),
            utilization,
            ready_instances: 3,
            commanded: Some(4),
        }
    }

    #[test]
    fn renders_all_gauges() {
        let out = render_prometheus(&[report("web", Some(0.75))]);

        assert!(out.contains("# TYPE tierscale_utilization_ratio gauge"));
        assert!(out.contains("tierscale_utilization_ratio{tier=\"web\"} 0.7500"));
        assert!(out.contains("tierscale_ready_instances{tier=\"web\"} 3"));
        assert!(out.contains("tierscale_commanded_replicas{tier=\"web\"} 4"));
    }

    #[test]
    fn no_data_omits_utilization_sample() {
        let out = render_prometheus(&[report("web", None)]);
        assert!(!out.contains("tierscale_utilization_ratio{"));
        assert!(out.contains("tierscale_ready_instances{tier=\"web\"} 3"));
    }

    #[test]
    fn empty_reports_still_have_headers() {
        let out = render_prometheus(&[]);
        assert!(out.contains("# HELP tierscale_ready_instances"));
        assert_eq!(out.lines().count(), 6);
    }
}
