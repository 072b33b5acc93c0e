//! Human-readable and CSV report formatting, grounded on
//! `examples/original_source/apib_reporting.c`'s
//! `PrintNormalResults`/`PrintShortResults`/`PrintReportingHeader`. This
//! module only lays out strings; all the numbers come from C7.

use crate::driver::Report;

const CSV_HEADER: &str = "Name,Throughput,Avg Latency,Threads,Connections,Elapsed,Completed,Successful,Errors,Sockets,Min Latency,Max Latency,p50,p90,p98,p99,Latency Std Dev,Avg Client CPU,Avg Server CPU,Avg Server2 CPU,Client Mem,Server Mem,Server2 Mem,Send Bandwidth,Receive Bandwidth";

pub fn csv_header() -> &'static str {
    CSV_HEADER
}

fn pct_or_blank(v: Option<f64>) -> String {
    v.map(|v| format!("{:.2}", v * 100.0)).unwrap_or_default()
}

fn ms(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}

/// One-line CSV report in the exact field order of spec section 6.
pub fn format_csv(report: &Report) -> String {
    let agg = &report.aggregate;
    format!(
        "{},{:.2},{:.3},{},{},{:.2},{},{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{},{},{},{},{},{},{:.3},{:.3}",
        report.name,
        report.throughput,
        ms(agg.avg_latency_nanos() as u64),
        report.threads,
        report.connections,
        agg.elapsed_seconds,
        agg.completed_requests(),
        agg.successful_requests,
        agg.failed_requests,
        agg.connections_opened,
        ms(agg.min_latency_nanos()),
        ms(agg.max_latency_nanos()),
        ms(agg.percentile_nanos(50)),
        ms(agg.percentile_nanos(90)),
        ms(agg.percentile_nanos(98)),
        ms(agg.percentile_nanos(99)),
        ms(agg.stddev_latency_nanos() as u64),
        pct_or_blank(report.client_cpu_pct),
        pct_or_blank(report.server_cpu_pct),
        pct_or_blank(report.server2_cpu_pct),
        pct_or_blank(report.client_mem_pct),
        pct_or_blank(report.server_mem_pct),
        pct_or_blank(report.server2_mem_pct),
        agg.send_bandwidth_mbps(),
        agg.receive_bandwidth_mbps(),
    )
}

/// Multi-line human-readable report.
pub fn format_human(report: &Report) -> String {
    let agg = &report.aggregate;
    let mut out = String::new();
    out.push_str(&format!("Duration:            {:.3} seconds\n", agg.elapsed_seconds));
    out.push_str(&format!("Attempted requests:  {}\n", agg.completed_requests()));
    out.push_str(&format!("Successful requests: {}\n", agg.successful_requests));
    out.push_str(&format!("Errors:              {}\n", agg.failed_requests));
    out.push_str(&format!("Throughput:          {:.2} requests/second\n", report.throughput));
    out.push_str(&format!("Avg. latency:        {:.3} ms\n", ms(agg.avg_latency_nanos() as u64)));
    out.push_str(&format!("Min. latency:        {:.3} ms\n", ms(agg.min_latency_nanos())));
    out.push_str(&format!("Max. latency:        {:.3} ms\n", ms(agg.max_latency_nanos())));
    out.push_str(&format!("50% latency:         {:.3} ms\n", ms(agg.percentile_nanos(50))));
    out.push_str(&format!("90% latency:         {:.3} ms\n", ms(agg.percentile_nanos(90))));
    out.push_str(&format!("98% latency:         {:.3} ms\n", ms(agg.percentile_nanos(98))));
    out.push_str(&format!("99% latency:         {:.3} ms\n", ms(agg.percentile_nanos(99))));
    out.push_str(&format!("Latency std. dev:    {:.3} ms\n", ms(agg.stddev_latency_nanos() as u64)));
    out.push_str(&format!("Send bandwidth:      {:.3} Mb/s\n", agg.send_bandwidth_mbps()));
    out.push_str(&format!("Receive bandwidth:   {:.3} Mb/s\n", agg.receive_bandwidth_mbps()));
    if let Some(cpu) = report.server_cpu_pct {
        out.push_str(&format!("Server CPU:          {:.2}%\n", cpu * 100.0));
    }
    if let Some(cpu) = report.server2_cpu_pct {
        out.push_str(&format!("Server2 CPU:         {:.2}%\n", cpu * 100.0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Aggregate;

    fn sample_report() -> Report {
        Report {
            name: "run".to_string(),
            throughput: 100.0,
            aggregate: Aggregate::from_totals(100, 5, 1_000_000, 500_000, 8, 1.0, vec![1_000_000, 2_000_000, 3_000_000]),
            threads: 2,
            connections: 10,
            client_cpu_pct: None,
            server_cpu_pct: Some(0.5),
            server2_cpu_pct: None,
            client_mem_pct: None,
            server_mem_pct: None,
            server2_mem_pct: None,
        }
    }

    #[test]
    fn csv_header_field_count_matches_row_field_count() {
        let header_fields = csv_header().split(',').count();
        let row_fields = format_csv(&sample_report()).split(',').count();
        assert_eq!(header_fields, row_fields);
    }

    #[test]
    fn csv_row_starts_with_run_name() {
        let row = format_csv(&sample_report());
        assert!(row.starts_with("run,"));
    }

    #[test]
    fn csv_sockets_column_reports_connections_opened_not_configured_concurrency() {
        let row = format_csv(&sample_report());
        let fields: Vec<&str> = row.split(',').collect();
        let sockets_ix = csv_header().split(',').position(|f| f == "Sockets").unwrap();
        assert_eq!(fields[sockets_ix], "8");
        assert_ne!(fields[sockets_ix], sample_report().connections.to_string());
    }

    #[test]
    fn human_report_mentions_throughput_and_percentiles() {
        let text = format_human(&sample_report());
        assert!(text.contains("Throughput"));
        assert!(text.contains("99% latency"));
    }
}
