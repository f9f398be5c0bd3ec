//! Rendering of `fluent-bit.conf` and `parsers.conf`.
use indoc::{formatdoc, indoc};
use itertools::Itertools as _;

use super::{APPLICATION_LOGGER, PARSER_MOUNT_PATH, PARSERS_FILE};
use crate::features::deployment::LOG_PATH;

/// One tailed log file pattern and where its lines go.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggerConfig {
    pub name: String,
    pub source_type: String,
    pub index: String,
    pub file_pattern: String,
}

impl LoggerConfig {
    pub fn new(name: &str, source_type: &str, index: &str, file_pattern: &str) -> Self {
        Self {
            name: name.to_owned(),
            source_type: source_type.to_owned(),
            index: index.to_owned(),
            file_pattern: file_pattern.to_owned(),
        }
    }

    /// Rotated files, `*.log` becomes `*.[1-9].log`.
    pub fn exclude_pattern(&self) -> String {
        self.file_pattern.replacen('.', ".[1-9].", 1)
    }

    fn tag(&self) -> String {
        format!("{}-{}", self.name, self.source_type)
    }
}

/// Settings that are the same for every logger of one application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Labels<'a> {
    pub application: &'a str,
    pub cluster: &'a str,
    pub version: &'a str,
    pub buffer_size: u32,
    pub retry_limit: Option<u32>,
}

/// `timeParser` and `evalXmlTimeParser` move the timestamp of a line to the
/// record time, the multiline parsers join continuation lines to the line
/// that starts with a timestamp or an `<EvaluationEvent` tag.
pub const PARSERS_CONF: &str = indoc! {r#"
    [PARSER]
        Name        timeParser
        Format      regex
        Regex       ^(?<timestamp>\d{4}-\d{1,2}-\d{1,2}T\d{2}:\d{2}:\d{2},\d*Z) (.*)
        Time_Key    timestamp
        Time_Format %Y-%m-%dT%H:%M:%S,%L%z

    [MULTILINE_PARSER]
        name          multiline-log4j
        type          regex
        key_content   event
        flush_timeout 1000
        rule          "start_state"   "/^(\d{4}-\d{1,2}-\d{1,2}T\d{2}:\d{2}:\d{2},\d*(Z|\+\d{4}))(.*)$/"  "cont"
        rule          "cont"          "/^(?!\d{4}-\d{1,2}-\d{1,2}T\d{2}:\d{2}:\d{2},\d*(Z|\+\d{4}))(.*)$/"  "cont"

    [PARSER]
        Name        evalXmlTimeParser
        Format      regex
        Regex       (?<timestamp>(?<=<Timestamp>)\d{4}-\d\d-\d\dT\d\d:\d\d:\d\d\.\d+Z(?=<\/Timestamp>))
        Time_Key    timestamp
        Time_Format %FT%T.%L%z

    [MULTILINE_PARSER]
        name          multiline-eval-xml
        type          regex
        key_content   event
        flush_timeout 1000
        rule          "start_state" "/<EvaluationEvent.*/"       "cont"
        rule          "cont"        "/^(?!<EvaluationEvent).*$/" "cont"

    [PARSER]
        Name          jsonTimeParser
        Format        json
        Time_Key      timestamp
        Time_Format   %Y-%m-%dT%H:%M:%S.%L%z
"#};

// Single line JSON events of log4j files are shipped as `_json`.
const FILTERS: &str = indoc! {r"
    [FILTER]
        Name rewrite_tag
        Match *-log4j
        Rule $event ^{.*}$ application-_json false

    [FILTER]
        Name parser
        Match *-_json
        Key_Name event
        Parser jsonTimeParser
        Preserve_Key On
        Reserve_Data On

    [FILTER]
        Name parser
        Match *-log4j
        Key_Name event
        Parser timeParser
        Preserve_Key On
        Reserve_Data On

    [FILTER]
        name multiline
        match *-log4j
        multiline.key_content event
        multiline.parser multiline-log4j

    [FILTER]
        Name parser
        Match *-evalevent_xml
        Key_Name event
        Parser evalXmlTimeParser
        Preserve_Key On
        Reserve_Data On

    [FILTER]
        Name parser
        Match *-ats:eval:xml
        Key_Name event
        Parser evalXmlTimeParser
        Preserve_Key On
        Reserve_Data On

    [FILTER]
        name multiline
        match *-evalevent_xml
        multiline.key_content event
        multiline.parser multiline-eval-xml

    [FILTER]
        name multiline
        match *-ats:eval:xml
        multiline.key_content event
        multiline.parser multiline-eval-xml"};

fn service() -> String {
    formatdoc! {"
        [SERVICE]
            Flush        1
            Daemon       Off
            Log_Level    info
            Log_File     {LOG_PATH}/fluentbit
            Parsers_File {PARSER_MOUNT_PATH}/{PARSERS_FILE}"
    }
}

fn input(logger: &LoggerConfig, buffer_size: u32) -> String {
    formatdoc! {"
        [INPUT]
            Name            tail
            Path            {LOG_PATH}/{pattern}
            Path_Key        source
            Exclude_Path    {exclude}
            Read_From_Head  true
            Tag             {tag}
            DB              {LOG_PATH}/{name}.db
            Buffer_Max_Size 512k
            Skip_Long_Lines On
            Mem_Buf_Limit   {buffer_size}MB
            Rotate_Wait     10
            Key             event",
        pattern = logger.file_pattern,
        exclude = logger.exclude_pattern(),
        tag = logger.tag(),
        name = logger.name,
    }
}

/// The own log of fluent-bit, echoed to stdout.
fn own_log_input() -> String {
    formatdoc! {"
        [INPUT]
            Name             tail
            Path             {LOG_PATH}/fluentbit
            Path_Key         source
            Tag              fluentbit
            Refresh_Interval 5
            Read_from_Head   true
            Key              event

        [FILTER]
            Name             stdout
            Match            fluentbit"
    }
}

/// Adds the fields every Splunk output refers to.
fn modify_filter(labels: &Labels<'_>) -> String {
    formatdoc! {"
        [FILTER]
            Name  modify
            Match *
            Add   host ${{POD_NAME}}
            Add   environment ${{POD_NAMESPACE}}
            Add   applicationVersionUnique {version}
            Add   nodetype openshift
            Add   applicationNameUnique {application}
            Add   clusterNameUnique {cluster}",
        version = labels.version,
        application = labels.application,
        cluster = labels.cluster,
    }
}

fn splunk_output(tag: &str, index: &str, source_type: &str, retry_limit: Option<u32>) -> String {
    let output = formatdoc! {"
        [OUTPUT]
            Name                       splunk
            Match                      {tag}
            Host                       ${{SPLUNK_HOST}}
            Port                       ${{SPLUNK_PORT}}
            Splunk_token               ${{HEC_TOKEN}}
            TLS                        On
            TLS.Verify                 Off
            event_index                {index}
            event_sourcetype           {source_type}
            event_host                 ${{POD_NAME}}
            event_source               $source
            event_field                application $applicationNameUnique
            event_field                cluster $clusterNameUnique
            event_field                environment $environment
            event_field                nodetype $nodetype
            event_field                version $applicationVersionUnique
            event_key                  $event
            net.keepalive_idle_timeout 10"
    };
    match retry_limit {
        Some(limit) => format!("{output}\n    Retry_Limit {limit}"),
        None => output,
    }
}

/// The full `fluent-bit.conf`, [`None`] without an application logger.
pub fn fluent_bit_conf(loggers: &[LoggerConfig], labels: &Labels<'_>) -> Option<String> {
    let application_index = &loggers
        .iter()
        .find(|logger| logger.name == APPLICATION_LOGGER)?
        .index;

    let outputs = loggers
        .iter()
        .flat_map(|logger| {
            let json = (logger.name == APPLICATION_LOGGER && logger.source_type == "log4j")
                .then(|| format!("{}-_json", logger.name));
            std::iter::once((logger.tag(), &logger.index, logger.source_type.as_str()))
                .chain(json.map(|tag| (tag, &logger.index, "_json")))
        })
        .map(|(tag, index, source_type)| splunk_output(&tag, index, source_type, labels.retry_limit));

    let mut sections = [
        service(),
        loggers.iter().map(|logger| input(logger, labels.buffer_size)).join("\n\n"),
        own_log_input(),
        FILTERS.to_owned(),
        modify_filter(labels),
    ]
    .into_iter()
    .chain(outputs)
    .chain(std::iter::once(splunk_output(
        "fluentbit",
        application_index,
        "fluentbit",
        None,
    )));
    Some(sections.join("\n\n"))
}
