//! Upstream -> warehouse column allow-lists and the tables they feed.

use adash_core::{RawRecord, TableSchema};

/// Static, injective rename table. Fields not listed are dropped on mapping.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMap {
    pairs: &'static [(&'static str, &'static str)],
}

impl ColumnMap {
    pub const fn new(pairs: &'static [(&'static str, &'static str)]) -> Self {
        Self { pairs }
    }

    pub fn warehouse_for(&self, upstream: &str) -> Option<&'static str> {
        self.pairs
            .iter()
            .find(|(u, _)| *u == upstream)
            .map(|(_, w)| *w)
    }

    pub fn upstream_for(&self, warehouse: &str) -> Option<&'static str> {
        self.pairs
            .iter()
            .find(|(_, w)| *w == warehouse)
            .map(|(u, _)| *u)
    }

    pub fn upstream_names(&self) -> impl Iterator<Item = &'static str> {
        self.pairs.iter().map(|(u, _)| *u)
    }

    pub fn warehouse_columns(&self) -> impl Iterator<Item = &'static str> {
        self.pairs.iter().map(|(_, w)| *w)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Renames the fields of `record` this map knows about and drops the rest.
    pub fn map_record(&self, record: &RawRecord) -> RawRecord {
        record
            .iter()
            .filter_map(|(name, value)| {
                self.warehouse_for(name)
                    .map(|column| (column.to_string(), value.clone()))
            })
            .collect()
    }
}

/// Landing page report headers as downloaded, keyed to the `ads_data` columns.
pub const ADS_REPORT_COLUMNS: ColumnMap = ColumnMap::new(&[
    ("Campaign ID", "CampaignId"),
    ("Campaign", "CampaignName"),
    ("Campaign state", "CampaignStatus"),
    ("Landing page", "UnexpandedFinalUrlString"),
    ("Day", "Date"),
    ("Device", "Device"),
    ("Active View avg. CPM", "ActiveViewCpm"),
    ("Active View viewable CTR", "ActiveViewCtr"),
    ("Active View viewable impressions", "ActiveViewImpressions"),
    ("Active View measurable impr. / impr.", "ActiveViewMeasurability"),
    ("Active View measurable cost", "ActiveViewMeasurableCost"),
    ("Active View measurable impr.", "ActiveViewMeasurableImpressions"),
    ("Active View viewable impr. / measurable impr.", "ActiveViewViewability"),
    ("All conv.", "AllConversions"),
    ("Avg. Cost", "AverageCost"),
    ("Avg. CPC", "AverageCpc"),
    ("Avg. CPE", "AverageCpe"),
    ("Avg. CPM", "AverageCpm"),
    ("Avg. CPV", "AverageCpv"),
    ("Avg. position", "AveragePosition"),
    ("Clicks", "Clicks"),
    ("Conv. rate", "ConversionRate"),
    ("Conversions", "Conversions"),
    ("Total conv. value", "ConversionValue"),
    ("Cost", "Cost"),
    ("Cost / conv.", "CostPerConversion"),
    ("Cross-device conv.", "CrossDeviceConversions"),
    ("CTR", "Ctr"),
    ("Engagement rate", "EngagementRate"),
    ("Engagements", "Engagements"),
    ("Impressions", "Impressions"),
    ("Interaction Rate", "InteractionRate"),
    ("Interactions", "Interactions"),
    ("Interaction Types", "InteractionTypes"),
    ("Mobile-friendly click rate", "PercentageMobileFriendlyClicks"),
    ("Valid AMP click rate", "PercentageValidAcceleratedMobilePagesClicks"),
    ("Mobile speed score", "SpeedScore"),
    ("Value / conv.", "ValuePerConversion"),
    ("View rate", "VideoViewRate"),
]);

/// Lighthouse audit ids whose `numericValue` lands in `lh_data`.
pub const AUDIT_COLUMNS: ColumnMap = ColumnMap::new(&[
    ("first-contentful-paint", "first_contentful_paint"),
    ("first-meaningful-paint", "first_meaningful_paint"),
    ("speed-index", "speed_index"),
    ("estimated-input-latency", "estimated_input_latency"),
    ("total-blocking-time", "total_blocking_time"),
    ("max-potential-fid", "max_potential_fid"),
    ("time-to-first-byte", "time_to_first_byte"),
    ("first-cpu-idle", "first_cpu_idle"),
    ("interactive", "interactive"),
    ("mainthread-work-breakdown", "mainthread_work_breakdown"),
    ("bootup-time", "bootup_time"),
    ("network-requests", "network_requests"),
    ("network-rtt", "network_rtt"),
    ("network-server-latency", "network_server_latency"),
    ("total-byte-weight", "total_byte_weight"),
    ("dom-size", "dom_size"),
]);

pub const ADS_TABLE: &str = "ads_data";
pub const AUDIT_TABLE: &str = "lh_data";

pub const CID_COLUMN: &str = "CID";
pub const CLIENT_NAME_COLUMN: &str = "ClientName";
pub const BASE_URL_COLUMN: &str = "BaseUrl";
pub const LANDING_PAGE_COLUMN: &str = "UnexpandedFinalUrlString";

/// Resource categories of the resource summary, already separator-normalized.
pub const RESOURCE_CATEGORIES: &[&str] = &[
    "document",
    "script",
    "stylesheet",
    "image",
    "media",
    "font",
    "other",
    "third_party",
];

pub fn resource_size_column(category: &str) -> String {
    format!("{category}_size")
}

pub fn ads_table(dataset: &str) -> TableSchema {
    let columns = ADS_REPORT_COLUMNS
        .warehouse_columns()
        .chain([CID_COLUMN, CLIENT_NAME_COLUMN, BASE_URL_COLUMN]);
    TableSchema::new(dataset, ADS_TABLE, columns)
}

pub fn audit_table(dataset: &str) -> TableSchema {
    let mut columns: Vec<String> = ["date", "url", "final_url", "lhscore"]
        .into_iter()
        .map(str::to_string)
        .collect();
    columns.extend(AUDIT_COLUMNS.warehouse_columns().map(str::to_string));
    columns.extend(RESOURCE_CATEGORIES.iter().map(|c| resource_size_column(c)));
    TableSchema::new(dataset, AUDIT_TABLE, columns)
}
