//! Segment planner and writer.
//!
//! Saving happens in four phases: classify the original layout, compute the
//! exact byte layout of every rewritten segment (a fixed point, since the
//! SeekHead and Cues sizes depend on the offsets they encode), decide
//! between patching in place and a full rewrite, and emit.
//!
//! The layout computation restarts whenever a SeekHead or Cues update
//! reports a size change. SeekHead and Cues sizes grow monotonically with
//! the offsets they encode and offsets grow monotonically with the segment
//! size, so the restarts are bounded; a cap turns a non-converging
//! computation into an `InvalidData` failure instead of a loop.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, warn};

use retag_core::{backup, Error, MediaFile, NotificationList, ProgressSink, Result};

use crate::attachments::AttachmentMaker;
use crate::config::{ElementPosition, WriteConfig};
use crate::container::MatroskaContainer;
use crate::crc;
use crate::ebml;
use crate::element::{ElemRef, ElementTree};
use crate::elements;
use crate::seekhead::SeekInfo;
use crate::tags::TagMaker;

const CONTEXT: &str = "making Matroska container";

/// Application identifier written as MuxingApp and WritingApp.
const APP_INFO: &str = concat!("retag-mkv v", env!("CARGO_PKG_VERSION"));

/// Cap on layout and per-segment fixed-point restarts.
const MAX_RESTARTS: u32 = 16;

fn app_info_element_total_size() -> u64 {
    ebml::string_element_length(elements::MUXING_APP, APP_INFO.len() as u64)
}

/// Buffered copy of one SegmentInfo element: its surviving children plus
/// the recomputed content size (children + Title + MuxingApp + WritingApp).
#[derive(Debug, Default)]
struct InfoBuffers {
    children: Vec<Vec<u8>>,
    data_size: u64,
}

/// Scratch state of one segment during planning and emission.
#[derive(Debug, Default)]
struct SegmentPlan {
    has_crc32: bool,
    buffered: bool,
    seek_info: SeekInfo,
    cues_element: Option<ElemRef>,
    cues_updater: crate::cues::CuePositionUpdater,
    info_buffers: Vec<InfoBuffers>,
    tracks_buffers: Vec<Vec<u8>>,
    chapters_buffers: Vec<Vec<u8>>,
    cluster_sizes: Vec<u64>,
    first_cluster: Option<ElemRef>,
    cluster_end_offset: u64,
    start_offset: u64,
    new_padding: u64,
    size_length: u32,
    total_data_size: u64,
    total_size: u64,
    new_data_offset: u64,
}

/// EBML header fields copied out of the container.
#[derive(Debug, Clone)]
struct HeaderFields {
    version: u64,
    read_version: u64,
    max_id_length: u64,
    max_size_length: u64,
    doc_type: String,
    doc_type_version: u64,
    doc_type_read_version: u64,
}

fn ebml_header_data_size(header: &HeaderFields) -> u64 {
    // seven sub-elements, each with a two-byte ID
    let mut size = 2 * 7;
    for value in [
        header.version,
        header.read_version,
        header.max_id_length,
        header.max_size_length,
        header.doc_type_version,
        header.doc_type_read_version,
    ] {
        let content = ebml::calculate_uint_length(value) as u64;
        size += content + ebml::calculate_size_denotation_length(content) as u64;
    }
    let doc_type_length = header.doc_type.len() as u64;
    size += doc_type_length + ebml::calculate_size_denotation_length(doc_type_length) as u64;
    size
}

struct LayoutInput<'a> {
    config: &'a WriteConfig,
    titles: &'a [String],
    first_element: ElemRef,
    tags_size: u64,
    attachments_size: u64,
    ebml_header_size: u64,
}

struct Layout {
    plans: Vec<SegmentPlan>,
    rewrite: bool,
    new_tag_pos: ElementPosition,
    new_cues_pos: ElementPosition,
    last_segment_index: usize,
    total_padding: u64,
}

struct EmitInput<'a> {
    plans: &'a mut [SegmentPlan],
    tag_makers: &'a [TagMaker],
    attachment_makers: &'a [AttachmentMaker],
    tag_elements_size: u64,
    attached_file_elements_size: u64,
    new_tag_pos: ElementPosition,
    new_cues_pos: ElementPosition,
    last_segment_index: usize,
    header: &'a HeaderFields,
    ebml_header_data_size: u64,
    titles: &'a [String],
    first_element: ElemRef,
    rewrite: bool,
}

/// Entry point: plan the new layout and write it out.
pub(crate) fn make_file(
    container: &mut MatroskaContainer,
    config: &WriteConfig,
    progress: &dyn ProgressSink,
) -> Result<()> {
    progress.update_status("calculating element sizes");

    if !container.header_parsed {
        container
            .notifications
            .critical(CONTEXT, "the header has not been parsed yet");
        return Err(Error::invalid_data("the header has not been parsed yet"));
    }
    let Some(first_element) = container.first_element else {
        container
            .notifications
            .critical(CONTEXT, "no EBML elements could be found");
        return Err(Error::invalid_data("no EBML elements could be found"));
    };

    let header = HeaderFields {
        version: container.version,
        read_version: container.read_version,
        max_id_length: container.max_id_length,
        max_size_length: container.max_size_length,
        doc_type: container.doc_type.clone(),
        doc_type_version: container.doc_type_version,
        doc_type_read_version: container.doc_type_read_version,
    };
    let titles = container.titles.clone();

    // precompute the Tags element
    let mut tag_makers = Vec::new();
    let mut tag_elements_size = 0u64;
    for tag in &container.tags {
        match tag.prepare_making() {
            Ok(maker) => {
                if maker.required_size() > 3 {
                    // a tag of three bytes is empty and gets skipped
                    tag_elements_size += maker.required_size();
                }
                tag_makers.push(maker);
            }
            Err(error) => container
                .notifications
                .critical(CONTEXT, format!("unable to prepare a tag for writing: {error}")),
        }
    }
    let tags_size = if tag_elements_size != 0 {
        4 + ebml::calculate_size_denotation_length(tag_elements_size) as u64 + tag_elements_size
    } else {
        0
    };

    // precompute the Attachments element
    let mut attachment_makers = Vec::new();
    let mut attached_file_elements_size = 0u64;
    for attachment in &container.attachments {
        if attachment.ignored {
            continue;
        }
        match attachment.prepare_making() {
            Ok(maker) => {
                if maker.required_size() > 3 {
                    attached_file_elements_size += maker.required_size();
                }
                attachment_makers.push(maker);
            }
            Err(error) => container.notifications.critical(
                CONTEXT,
                format!("unable to prepare an attachment for writing: {error}"),
            ),
        }
    }
    let attachments_size = if attached_file_elements_size != 0 {
        4 + ebml::calculate_size_denotation_length(attached_file_elements_size) as u64
            + attached_file_elements_size
    } else {
        0
    };

    let header_data_size = ebml_header_data_size(&header);
    let ebml_header_size =
        4 + ebml::calculate_size_denotation_length(header_data_size) as u64 + header_data_size;

    let layout_input = LayoutInput {
        config,
        titles: &titles,
        first_element,
        tags_size,
        attachments_size,
        ebml_header_size,
    };
    let mut layout = match plan_layout(
        &mut container.tree,
        &mut container.file,
        &mut container.notifications,
        &layout_input,
        progress,
    ) {
        Ok(layout) => layout,
        Err(error) => {
            if !error.is_aborted() {
                container
                    .notifications
                    .critical(CONTEXT, format!("parsing the original file failed: {error}"));
            }
            return Err(error);
        }
    };
    debug!(
        rewrite = layout.rewrite,
        padding = layout.total_padding,
        "segment layout computed"
    );

    if progress.is_aborted() {
        return Err(Error::Aborted);
    }
    progress.update_status("preparing streams");

    let original_path = container.file.path().to_path_buf();

    if layout.rewrite {
        if let Some(save_path) = config.save_file_path.clone() {
            // write to a separate path; the original stays untouched
            let mut output = match MediaFile::create(&save_path) {
                Ok(output) => output,
                Err(error) => {
                    container.notifications.critical(
                        CONTEXT,
                        "opening the streams to write the output file failed",
                    );
                    return Err(error);
                }
            };
            let mut emit_input = EmitInput {
                plans: &mut layout.plans,
                tag_makers: &tag_makers,
                attachment_makers: &attachment_makers,
                tag_elements_size,
                attached_file_elements_size,
                new_tag_pos: layout.new_tag_pos,
                new_cues_pos: layout.new_cues_pos,
                last_segment_index: layout.last_segment_index,
                header: &header,
                ebml_header_data_size: header_data_size,
                titles: &titles,
                first_element,
                rewrite: true,
            };
            match emit(
                &mut container.tree,
                &mut container.file,
                &mut output,
                &mut emit_input,
                progress,
            ) {
                Ok(crc32_offsets) => {
                    // the save path is the regular path from now on
                    container.file = output;
                    finish_output(container, &crc32_offsets, progress)
                }
                Err(error) => {
                    drop(output);
                    let _ = std::fs::remove_file(&save_path);
                    container.notifications.critical(
                        CONTEXT,
                        format!("writing the output file failed: {error}"),
                    );
                    container.reset_parse_state();
                    Err(error)
                }
            }
        } else {
            // move the original aside and recreate it
            let (backup_path, backup_file) =
                match backup::create_backup(&original_path, config.backup_directory.as_deref()) {
                    Ok(pair) => pair,
                    Err(error) => {
                        container.notifications.critical(
                            CONTEXT,
                            "creation of a backup file (to rewrite the original file) failed",
                        );
                        return Err(error);
                    }
                };
            // the original elements are now read from the backup
            if let Err(error) = container.file.assign(&backup_path, backup_file) {
                return Err(fail_with_restore(container, &original_path, &backup_path, error));
            }
            let mut output = match MediaFile::create(&original_path) {
                Ok(output) => output,
                Err(error) => {
                    return Err(fail_with_restore(container, &original_path, &backup_path, error));
                }
            };
            let mut emit_input = EmitInput {
                plans: &mut layout.plans,
                tag_makers: &tag_makers,
                attachment_makers: &attachment_makers,
                tag_elements_size,
                attached_file_elements_size,
                new_tag_pos: layout.new_tag_pos,
                new_cues_pos: layout.new_cues_pos,
                last_segment_index: layout.last_segment_index,
                header: &header,
                ebml_header_data_size: header_data_size,
                titles: &titles,
                first_element,
                rewrite: true,
            };
            let emitted = emit(
                &mut container.tree,
                &mut container.file,
                &mut output,
                &mut emit_input,
                progress,
            );
            match emitted {
                Ok(crc32_offsets) => {
                    container.file = output;
                    match finish_output(container, &crc32_offsets, progress) {
                        Ok(()) => {
                            let _ = std::fs::remove_file(&backup_path);
                            Ok(())
                        }
                        Err(error) => {
                            Err(fail_with_restore(container, &original_path, &backup_path, error))
                        }
                    }
                }
                Err(error) => {
                    drop(output);
                    Err(fail_with_restore(container, &original_path, &backup_path, error))
                }
            }
        }
    } else {
        // in-place: the payload of assigned attachments may live in the
        // region about to be overwritten
        for maker in &mut attachment_makers {
            maker.buffer_attachment(&mut container.file)?;
        }
        if let Err(error) = container.file.reopen_rw() {
            container
                .notifications
                .critical(CONTEXT, "opening the file with write permissions failed");
            return Err(error);
        }
        // a second handle keeps reads of the cluster region independent of
        // the write cursor
        let mut input = MediaFile::open(&original_path)?;
        let mut emit_input = EmitInput {
            plans: &mut layout.plans,
            tag_makers: &tag_makers,
            attachment_makers: &attachment_makers,
            tag_elements_size,
            attached_file_elements_size,
            new_tag_pos: layout.new_tag_pos,
            new_cues_pos: layout.new_cues_pos,
            last_segment_index: layout.last_segment_index,
            header: &header,
            ebml_header_data_size: header_data_size,
            titles: &titles,
            first_element,
            rewrite: false,
        };
        match emit(
            &mut container.tree,
            &mut input,
            &mut container.file,
            &mut emit_input,
            progress,
        ) {
            Ok(crc32_offsets) => finish_output(container, &crc32_offsets, progress),
            Err(error) => {
                container
                    .notifications
                    .critical(CONTEXT, format!("writing the file failed: {error}"));
                container.reset_parse_state();
                Err(error)
            }
        }
    }
}

/// Restore the original file from its backup and hand back the causing
/// error; also reattaches the container to the restored file.
fn fail_with_restore(
    container: &mut MatroskaContainer,
    original_path: &Path,
    backup_path: &Path,
    error: Error,
) -> Error {
    container
        .notifications
        .critical(CONTEXT, format!("writing the output file failed: {error}"));
    let error = backup::handle_failure_after_modification(original_path, backup_path, error);
    container.reset_parse_state();
    match MediaFile::open(original_path) {
        Ok(file) => container.file = file,
        Err(reopen_error) => warn!(%reopen_error, "unable to reopen the restored original file"),
    }
    error
}

/// Backpatch CRC-32 placeholders, then reparse the written file.
fn finish_output(
    container: &mut MatroskaContainer,
    crc32_offsets: &[(u64, u64)],
    progress: &dyn ProgressSink,
) -> Result<()> {
    if !crc32_offsets.is_empty() {
        progress.update_status("updating CRC-32 checksums");
        for &(offset, enclosing_size) in crc32_offsets {
            let checksum =
                crc::crc32_of_range(&mut container.file, offset + 6, enclosing_size - 6)?;
            container.file.seek(SeekFrom::Start(offset + 2))?;
            container.file.write_u32::<LittleEndian>(checksum)?;
        }
    }
    container.file.flush()?;
    container.file.refresh_size()?;

    progress.update_status("reparsing the output file");
    container.reset();
    container.parse_header().map_err(|error| {
        container
            .notifications
            .critical(CONTEXT, "unable to reparse the header of the new file");
        error
    })?;
    progress.update_percentage(100.0);
    Ok(())
}

/// Phases A-C: classify the original layout, compute every segment's byte
/// layout and decide between in-place patching and a full rewrite.
fn plan_layout(
    tree: &mut ElementTree,
    io: &mut MediaFile,
    notifications: &mut NotificationList,
    input: &LayoutInput,
    progress: &dyn ProgressSink,
) -> Result<Layout> {
    let config = input.config;

    // phase A: count segments, find the original tag position
    let mut current_tag_pos = ElementPosition::Keep;
    let mut last_segment_index: Option<usize> = None;
    {
        let mut first_cluster_found = false;
        let mut first_tag_found = false;
        let mut level0 = Some(input.first_element);
        while let Some(l0) = level0 {
            tree.parse(l0, io)?;
            if tree.id(l0) == elements::SEGMENT {
                last_segment_index = Some(last_segment_index.map_or(0, |index| index + 1));
                let mut level1 = tree.first_child(l0, io)?;
                while let Some(l1) = level1 {
                    if first_cluster_found || first_tag_found {
                        break;
                    }
                    tree.parse(l1, io)?;
                    match tree.id(l1) {
                        elements::TAGS | elements::ATTACHMENTS => first_tag_found = true,
                        elements::CLUSTER => first_cluster_found = true,
                        _ => {}
                    }
                    level1 = tree.next_sibling(l1, io)?;
                }
            }
            level0 = tree.next_sibling(l0, io)?;
        }
        if first_tag_found {
            current_tag_pos = ElementPosition::BeforeData;
        } else if first_cluster_found {
            current_tag_pos = ElementPosition::AfterData;
        }
    }
    let Some(last_segment_index) = last_segment_index else {
        notifications.critical(CONTEXT, "no \"Segment\" element found");
        return Err(Error::invalid_data("no Segment element found"));
    };

    let mut plans: Vec<SegmentPlan> = std::iter::repeat_with(SegmentPlan::default)
        .take(last_segment_index + 1)
        .collect();

    let mut new_tag_pos = config.tag_position;
    if new_tag_pos == ElementPosition::Keep {
        new_tag_pos = match current_tag_pos {
            ElementPosition::Keep => ElementPosition::BeforeData,
            other => other,
        };
    }
    let mut new_cues_pos = config.index_position;
    let mut current_cues_pos = ElementPosition::Keep;
    let mut rewrite_required = config.force_rewrite || config.save_file_path.is_some();

    // phase B (+C): fixed point over the whole layout
    let mut layout_restarts = 0u32;
    'layout: loop {
        layout_restarts += 1;
        if layout_restarts > MAX_RESTARTS {
            notifications.critical(CONTEXT, "the file layout computation did not converge");
            return Err(Error::invalid_data("file layout computation did not converge"));
        }
        let pass_rewrite = rewrite_required;

        // a rewrite always uses the preferred tag/cue positions
        if rewrite_required {
            new_tag_pos = config.tag_position;
            if new_tag_pos == ElementPosition::Keep {
                new_tag_pos = match current_tag_pos {
                    ElementPosition::Keep => ElementPosition::BeforeData,
                    other => other,
                };
            }
            new_cues_pos = config.index_position;
        }

        progress.update_status("calculating segment data");
        progress.update_percentage(0.0);

        let mut current_offset = input.ebml_header_size;
        let mut new_padding_total = 0u64;
        let mut segment_index = 0usize;
        let mut level0 = Some(input.first_element);
        while let Some(l0) = level0 {
            match tree.id(l0) {
                elements::EBML | elements::VOID | elements::CRC32 => {
                    // the header is accounted separately; top-level Void and
                    // CRC-32 elements are omitted from the output
                }
                elements::SEGMENT => {
                    let plan = &mut plans[segment_index];
                    plan.new_padding = 0;

                    if plan.cues_element.is_none() {
                        if let Some(cues) = tree.child_by_id(l0, elements::CUES, io)? {
                            plan.cues_element = Some(cues);
                            let mut gathered = NotificationList::new();
                            let parsed =
                                plan.cues_updater.parse(tree, cues, io, &mut gathered);
                            notifications.take_from(&mut gathered);
                            parsed?;
                        }
                    }
                    if plan.first_cluster.is_none() {
                        plan.first_cluster = tree.child_by_id(l0, elements::CLUSTER, io)?;
                    }
                    if let (Some(cues), Some(cluster)) = (plan.cues_element, plan.first_cluster) {
                        current_cues_pos =
                            if tree.start_offset(cues) < tree.start_offset(cluster) {
                                ElementPosition::BeforeData
                            } else {
                                ElementPosition::AfterData
                            };
                        if new_cues_pos == ElementPosition::Keep {
                            new_cues_pos = current_cues_pos;
                        }
                    } else if new_cues_pos == ElementPosition::Keep {
                        new_cues_pos = ElementPosition::BeforeData;
                    }

                    plan.start_offset = current_offset;
                    plan.has_crc32 = match tree.first_child(l0, io)? {
                        Some(first) => {
                            tree.parse(first, io)?;
                            tree.id(first) == elements::CRC32
                        }
                        None => false,
                    };
                    if !plan.buffered {
                        buffer_segment_metadata(
                            tree,
                            io,
                            l0,
                            plan,
                            input.titles.get(segment_index),
                        )?;
                        plan.buffered = true;
                    }

                    // per-segment size fixed point
                    let mut segment_restarts = 0u32;
                    'segment: loop {
                        segment_restarts += 1;
                        if segment_restarts > MAX_RESTARTS {
                            notifications.critical(
                                CONTEXT,
                                "the segment size computation did not converge",
                            );
                            return Err(Error::invalid_data(
                                "segment size computation did not converge",
                            ));
                        }

                        // CRC-32 placeholder and SeekHead come first
                        plan.total_data_size = if plan.has_crc32 { 6 } else { 0 };
                        plan.total_data_size += plan.seek_info.actual_size();

                        // SegmentInfo elements
                        let mut restart = false;
                        for index in 0..plan.info_buffers.len() {
                            if plan.seek_info.push(
                                index,
                                elements::INFO,
                                plan.total_data_size,
                            ) {
                                restart = true;
                                break;
                            }
                            let data_size = plan.info_buffers[index].data_size;
                            plan.total_data_size += 4
                                + ebml::calculate_size_denotation_length(data_size) as u64
                                + data_size;
                        }
                        if restart {
                            continue 'segment;
                        }

                        // Tracks and Chapters (copied verbatim)
                        for (id, count) in [
                            (elements::TRACKS, plan.tracks_buffers.len()),
                            (elements::CHAPTERS, plan.chapters_buffers.len()),
                        ] {
                            for index in 0..count {
                                if plan.seek_info.push(index, id, plan.total_data_size) {
                                    restart = true;
                                    break;
                                }
                                let length = if id == elements::TRACKS {
                                    plan.tracks_buffers[index].len()
                                } else {
                                    plan.chapters_buffers[index].len()
                                };
                                plan.total_data_size += length as u64;
                            }
                            if restart {
                                break;
                            }
                        }
                        if restart {
                            continue 'segment;
                        }

                        // leading Tags and Attachments
                        if new_tag_pos == ElementPosition::BeforeData && segment_index == 0 {
                            if input.tags_size != 0 {
                                if plan.seek_info.push(0, elements::TAGS, plan.total_data_size)
                                {
                                    continue 'segment;
                                }
                                plan.total_data_size += input.tags_size;
                            }
                            if input.attachments_size != 0 {
                                if plan.seek_info.push(
                                    0,
                                    elements::ATTACHMENTS,
                                    plan.total_data_size,
                                ) {
                                    continue 'segment;
                                }
                                plan.total_data_size += input.attachments_size;
                            }
                        }

                        let offset_before_cues = plan.total_data_size;

                        // leading Cues
                        if new_cues_pos == ElementPosition::BeforeData
                            && plan.cues_element.is_some()
                        {
                            if plan.seek_info.push(0, elements::CUES, plan.total_data_size) {
                                continue 'segment;
                            }
                            plan.total_data_size += plan.cues_updater.total_size();
                        }

                        // cluster accounting; restarts here only re-run the
                        // part after the leading Cues
                        let mut cues_restarts = 0u32;
                        'cues: loop {
                            cues_restarts += 1;
                            if cues_restarts > MAX_RESTARTS {
                                notifications.critical(
                                    CONTEXT,
                                    "the Cues size computation did not converge",
                                );
                                return Err(Error::invalid_data(
                                    "Cues size computation did not converge",
                                ));
                            }

                            if !pass_rewrite {
                                let Some(first_cluster) = plan.first_cluster else {
                                    // no clusters: reuse the rewrite branch
                                    // instead of guessing at offsets
                                    rewrite_required = true;
                                    break 'cues;
                                };
                                let first_cluster_offset = tree.start_offset(first_cluster);
                                if current_offset + 4 + plan.total_data_size
                                    > first_cluster_offset
                                {
                                    rewrite_required = true;
                                    break 'cues;
                                }
                                let original_header_size = tree.header_size(l0);
                                if original_header_size <= 4 || original_header_size > 12 {
                                    notifications.critical(
                                        CONTEXT,
                                        "the header size of the \"Segment\" element in the original file is invalid",
                                    );
                                    return Err(Error::invalid_data(
                                        "invalid Segment header size in the original file",
                                    ));
                                }
                                plan.size_length = original_header_size - 4;

                                'denotation: loop {
                                    let segment_data_offset =
                                        current_offset + 4 + plan.size_length as u64;
                                    if plan.seek_info.push(
                                        0,
                                        elements::CLUSTER,
                                        first_cluster_offset - segment_data_offset,
                                    ) {
                                        continue 'segment;
                                    }

                                    // relocate the cue entries of untouched
                                    // clusters and find the cluster end
                                    let mut restart_at_cues = false;
                                    let mut cluster = Some(first_cluster);
                                    while let Some(cl) = cluster {
                                        let cluster_read_offset =
                                            tree.start_offset(cl) - tree.data_offset(l0);
                                        plan.cluster_end_offset = tree.end_offset(cl);
                                        if plan.cues_element.is_some()
                                            && plan.cues_updater.update_offsets(
                                                cluster_read_offset,
                                                tree.start_offset(cl) - segment_data_offset,
                                            )
                                            && new_cues_pos == ElementPosition::BeforeData
                                        {
                                            restart_at_cues = true;
                                            break;
                                        }
                                        cluster =
                                            tree.sibling_by_id(cl, elements::CLUSTER, io)?;
                                    }
                                    if restart_at_cues {
                                        plan.total_data_size =
                                            offset_before_cues + plan.cues_updater.total_size();
                                        continue 'cues;
                                    }

                                    plan.total_data_size = plan.cluster_end_offset
                                        - current_offset
                                        - 4
                                        - plan.size_length as u64;

                                    // trailing Cues
                                    if new_cues_pos == ElementPosition::AfterData
                                        && plan.cues_element.is_some()
                                    {
                                        if plan.seek_info.push(
                                            0,
                                            elements::CUES,
                                            plan.total_data_size,
                                        ) {
                                            continue 'segment;
                                        }
                                        plan.total_data_size += plan.cues_updater.total_size();
                                    }
                                    // trailing Tags and Attachments
                                    if new_tag_pos == ElementPosition::AfterData
                                        && segment_index == last_segment_index
                                    {
                                        if input.tags_size != 0 {
                                            if plan.seek_info.push(
                                                0,
                                                elements::TAGS,
                                                plan.total_data_size,
                                            ) {
                                                continue 'segment;
                                            }
                                            plan.total_data_size += input.tags_size;
                                        }
                                        if input.attachments_size != 0 {
                                            if plan.seek_info.push(
                                                0,
                                                elements::ATTACHMENTS,
                                                plan.total_data_size,
                                            ) {
                                                continue 'segment;
                                            }
                                            plan.total_data_size += input.attachments_size;
                                        }
                                    }

                                    // the assumed size denotation width must
                                    // match the value it ends up denoting
                                    let computed = ebml::calculate_size_denotation_length(
                                        plan.total_data_size,
                                    );
                                    if plan.size_length != computed {
                                        plan.size_length = computed;
                                        continue 'denotation;
                                    }

                                    let mut metadata_end = current_offset
                                        + 4
                                        + plan.size_length as u64
                                        + offset_before_cues;
                                    if new_cues_pos == ElementPosition::BeforeData
                                        && plan.cues_element.is_some()
                                    {
                                        metadata_end += plan.cues_updater.total_size();
                                    }
                                    if metadata_end <= first_cluster_offset {
                                        let padding = first_cluster_offset - metadata_end;
                                        if padding == 1 {
                                            // a Void element needs two bytes
                                            rewrite_required = true;
                                        } else {
                                            plan.new_padding = padding;
                                            new_padding_total += padding;
                                        }
                                    } else {
                                        rewrite_required = true;
                                    }
                                    break 'denotation;
                                }
                                break 'cues;
                            }

                            // rewrite branch: recompute every cluster
                            if segment_index == 0 && plan.first_cluster.is_some() {
                                plan.new_padding = config.preferred_padding;
                                new_padding_total = config.preferred_padding;
                                plan.total_data_size += plan.new_padding;
                            }

                            plan.cluster_sizes.clear();
                            let mut restart_at_cues = false;
                            let mut prev_cluster_total = 0u64;
                            let mut index = 0usize;
                            let mut cluster = tree.child_by_id(l0, elements::CLUSTER, io)?;
                            while let Some(cl) = cluster {
                                let cluster_read_offset =
                                    tree.start_offset(cl) - tree.data_offset(l0);
                                if plan.cues_element.is_some()
                                    && plan.cues_updater.update_offsets(
                                        cluster_read_offset,
                                        plan.total_data_size,
                                    )
                                    && new_cues_pos == ElementPosition::BeforeData
                                {
                                    restart_at_cues = true;
                                    break;
                                }
                                if index == 0
                                    && plan.seek_info.push(
                                        index,
                                        elements::CLUSTER,
                                        plan.total_data_size,
                                    )
                                {
                                    continue 'segment;
                                }

                                let cluster_position = plan.total_data_size;
                                let mut cluster_size = 0u64;
                                let mut cluster_read_size = 0u64;
                                let mut child = tree.first_child(cl, io)?;
                                while let Some(ch) = child {
                                    tree.parse(ch, io)?;
                                    if plan.cues_element.is_some()
                                        && plan.cues_updater.update_relative_offsets(
                                            cluster_read_offset,
                                            cluster_read_size,
                                            cluster_size,
                                        )
                                        && new_cues_pos == ElementPosition::BeforeData
                                    {
                                        restart_at_cues = true;
                                        break;
                                    }
                                    match tree.id(ch) {
                                        elements::VOID | elements::CRC32 => {}
                                        elements::POSITION => {
                                            cluster_size += 1
                                                + 1
                                                + ebml::calculate_uint_length(cluster_position)
                                                    as u64;
                                        }
                                        elements::PREV_SIZE => {
                                            cluster_size += 1
                                                + 1
                                                + ebml::calculate_uint_length(prev_cluster_total)
                                                    as u64;
                                        }
                                        _ => cluster_size += tree.total_size(ch),
                                    }
                                    cluster_read_size += tree.total_size(ch);
                                    child = tree.next_sibling(ch, io)?;
                                }
                                if restart_at_cues {
                                    break;
                                }
                                plan.cluster_sizes.push(cluster_size);
                                let cluster_total = 4
                                    + ebml::calculate_size_denotation_length(cluster_size) as u64
                                    + cluster_size;
                                plan.total_data_size += cluster_total;
                                prev_cluster_total = cluster_total;
                                index += 1;
                                cluster = tree.sibling_by_id(cl, elements::CLUSTER, io)?;
                            }
                            if restart_at_cues {
                                plan.total_data_size =
                                    offset_before_cues + plan.cues_updater.total_size();
                                continue 'cues;
                            }

                            // trailing Cues
                            if new_cues_pos == ElementPosition::AfterData
                                && plan.cues_element.is_some()
                            {
                                if plan.seek_info.push(0, elements::CUES, plan.total_data_size)
                                {
                                    continue 'segment;
                                }
                                plan.total_data_size += plan.cues_updater.total_size();
                            }
                            // trailing Tags and Attachments
                            if new_tag_pos == ElementPosition::AfterData
                                && segment_index == last_segment_index
                            {
                                if input.tags_size != 0 {
                                    if plan.seek_info.push(
                                        0,
                                        elements::TAGS,
                                        plan.total_data_size,
                                    ) {
                                        continue 'segment;
                                    }
                                    plan.total_data_size += input.tags_size;
                                }
                                if input.attachments_size != 0 {
                                    if plan.seek_info.push(
                                        0,
                                        elements::ATTACHMENTS,
                                        plan.total_data_size,
                                    ) {
                                        continue 'segment;
                                    }
                                    plan.total_data_size += input.attachments_size;
                                }
                            }
                            break 'cues;
                        }
                        break 'segment;
                    }

                    // an impossible in-place layout may be fixable by moving
                    // tags (then cues) behind the media data
                    if !pass_rewrite && rewrite_required {
                        if new_tag_pos != ElementPosition::AfterData
                            && (!config.force_tag_position
                                || (config.tag_position == ElementPosition::Keep
                                    && current_tag_pos == ElementPosition::Keep))
                        {
                            new_tag_pos = ElementPosition::AfterData;
                            rewrite_required = false;
                        } else if new_cues_pos != ElementPosition::AfterData
                            && (!config.force_index_position
                                || (config.index_position == ElementPosition::Keep
                                    && current_cues_pos == ElementPosition::Keep))
                        {
                            new_cues_pos = ElementPosition::AfterData;
                            rewrite_required = false;
                        }
                        continue 'layout;
                    }

                    plan.total_size = 4
                        + ebml::calculate_size_denotation_length(plan.total_data_size) as u64
                        + plan.total_data_size;
                    current_offset += plan.total_size;
                    segment_index += 1;
                }
                _ => {
                    notifications.warning(
                        CONTEXT,
                        format!(
                            "the top-level element {} of the original file is unknown and will just be copied",
                            tree.id_string(l0)
                        ),
                    );
                    current_offset += tree.total_size(l0);
                }
            }
            level0 = tree.next_sibling(l0, io)?;
            if progress.is_aborted() {
                return Err(Error::Aborted);
            }
        }

        // phase C: the padding must stay within the configured bounds
        if !rewrite_required
            && (new_padding_total > config.max_padding || new_padding_total < config.min_padding)
        {
            rewrite_required = true;
            continue 'layout;
        }

        return Ok(Layout {
            plans,
            rewrite: rewrite_required,
            new_tag_pos,
            new_cues_pos,
            last_segment_index,
            total_padding: new_padding_total,
        });
    }
}

/// Buffer everything of a segment's metadata that must survive while the
/// region it was read from is overwritten: SegmentInfo children (except the
/// ones that are regenerated) and the verbatim Tracks/Chapters elements.
fn buffer_segment_metadata(
    tree: &mut ElementTree,
    io: &mut MediaFile,
    segment: ElemRef,
    plan: &mut SegmentPlan,
    title: Option<&String>,
) -> Result<()> {
    plan.info_buffers.clear();
    plan.tracks_buffers.clear();
    plan.chapters_buffers.clear();

    let mut info = tree.child_by_id(segment, elements::INFO, io)?;
    while let Some(current) = info {
        let mut children = Vec::new();
        let mut child = tree.first_child(current, io)?;
        while let Some(ch) = child {
            tree.parse(ch, io)?;
            match tree.id(ch) {
                // regenerated or omitted on write
                elements::VOID
                | elements::CRC32
                | elements::TITLE
                | elements::MUXING_APP
                | elements::WRITING_APP => {}
                _ => children.push(tree.buffer_element(ch, io)?),
            }
            child = tree.next_sibling(ch, io)?;
        }
        let mut data_size = 2 * app_info_element_total_size();
        if let Some(title) = title {
            if !title.is_empty() {
                data_size += ebml::string_element_length(elements::TITLE, title.len() as u64);
            }
        }
        data_size += children.iter().map(|b| b.len() as u64).sum::<u64>();
        plan.info_buffers.push(InfoBuffers {
            children,
            data_size,
        });
        info = tree.sibling_by_id(current, elements::INFO, io)?;
    }

    let mut tracks = tree.child_by_id(segment, elements::TRACKS, io)?;
    while let Some(current) = tracks {
        plan.tracks_buffers.push(tree.buffer_element(current, io)?);
        tracks = tree.sibling_by_id(current, elements::TRACKS, io)?;
    }
    let mut chapters = tree.child_by_id(segment, elements::CHAPTERS, io)?;
    while let Some(current) = chapters {
        plan.chapters_buffers.push(tree.buffer_element(current, io)?);
        chapters = tree.sibling_by_id(current, elements::CHAPTERS, io)?;
    }
    Ok(())
}

/// Phase D: write the planned layout.
///
/// Returns the `(offset, enclosing segment size)` pairs of the written
/// CRC-32 placeholders so they can be backpatched after everything else is
/// on disk.
fn emit(
    tree: &mut ElementTree,
    input: &mut MediaFile,
    out: &mut MediaFile,
    args: &mut EmitInput<'_>,
    progress: &dyn ProgressSink,
) -> Result<Vec<(u64, u64)>> {
    progress.update_status("writing EBML header");
    out.seek(SeekFrom::Start(0))?;
    ebml::write_id(out, elements::EBML)?;
    ebml::write_size(out, args.ebml_header_data_size)?;
    ebml::write_uint_element(out, elements::EBML_VERSION, args.header.version)?;
    ebml::write_uint_element(out, elements::EBML_READ_VERSION, args.header.read_version)?;
    ebml::write_uint_element(out, elements::EBML_MAX_ID_LENGTH, args.header.max_id_length)?;
    ebml::write_uint_element(
        out,
        elements::EBML_MAX_SIZE_LENGTH,
        args.header.max_size_length,
    )?;
    ebml::write_string_element(out, elements::DOC_TYPE, &args.header.doc_type)?;
    ebml::write_uint_element(
        out,
        elements::DOC_TYPE_VERSION,
        args.header.doc_type_version,
    )?;
    ebml::write_uint_element(
        out,
        elements::DOC_TYPE_READ_VERSION,
        args.header.doc_type_read_version,
    )?;

    let mut crc32_offsets: Vec<(u64, u64)> = Vec::new();
    let mut segment_index = 0usize;
    let mut level0 = Some(args.first_element);
    while let Some(l0) = level0 {
        match tree.id(l0) {
            elements::EBML | elements::VOID | elements::CRC32 => {}
            elements::SEGMENT => {
                if progress.is_aborted() {
                    return Err(Error::Aborted);
                }
                progress.update_status("writing segment header");

                let plan = &mut args.plans[segment_index];
                ebml::write_id(out, elements::SEGMENT)?;
                ebml::write_size(out, plan.total_data_size)?;
                plan.new_data_offset = out.stream_position()?;
                let segment_data_offset = plan.new_data_offset;

                // CRC-32 placeholder, value patched after everything is
                // written
                if plan.has_crc32 {
                    crc32_offsets.push((out.stream_position()?, plan.total_data_size));
                    out.write_all(&[0xBF, 0x84, 0, 0, 0, 0])?;
                }

                plan.seek_info.make(out)?;

                // SegmentInfo with regenerated application identifiers
                for info in &plan.info_buffers {
                    ebml::write_id(out, elements::INFO)?;
                    ebml::write_size(out, info.data_size)?;
                    for child in &info.children {
                        out.write_all(child)?;
                    }
                    if let Some(title) = args.titles.get(segment_index) {
                        if !title.is_empty() {
                            ebml::write_string_element(out, elements::TITLE, title)?;
                        }
                    }
                    ebml::write_string_element(out, elements::MUXING_APP, APP_INFO)?;
                    ebml::write_string_element(out, elements::WRITING_APP, APP_INFO)?;
                }

                for buffer in plan
                    .tracks_buffers
                    .iter()
                    .chain(plan.chapters_buffers.iter())
                {
                    out.write_all(buffer)?;
                }

                if args.new_tag_pos == ElementPosition::BeforeData && segment_index == 0 {
                    write_tags_block(out, args.tag_makers, args.tag_elements_size)?;
                    write_attachments_block(
                        out,
                        input,
                        args.attachment_makers,
                        args.attached_file_elements_size,
                        progress,
                    )?;
                }

                if args.new_cues_pos == ElementPosition::BeforeData && plan.cues_element.is_some()
                {
                    plan.cues_updater.make(out)?;
                }

                if plan.new_padding != 0 {
                    write_void(out, plan.new_padding)?;
                }

                if args.rewrite {
                    progress.update_status("writing clusters");
                    let mut size_index = 0usize;
                    let mut prev_cluster_total = 0u64;
                    let mut cluster = tree.child_by_id(l0, elements::CLUSTER, input)?;
                    while let Some(cl) = cluster {
                        if progress.is_aborted() {
                            return Err(Error::Aborted);
                        }
                        let cluster_position = out.stream_position()? - segment_data_offset;
                        let Some(&cluster_size) = plan.cluster_sizes.get(size_index) else {
                            return Err(Error::invalid_data(
                                "the cluster count changed between planning and writing",
                            ));
                        };
                        ebml::write_id(out, elements::CLUSTER)?;
                        ebml::write_size(out, cluster_size)?;
                        let mut child = tree.first_child(cl, input)?;
                        while let Some(ch) = child {
                            match tree.id(ch) {
                                elements::VOID | elements::CRC32 => {}
                                elements::POSITION => {
                                    ebml::write_uint_element(
                                        out,
                                        elements::POSITION,
                                        cluster_position,
                                    )?;
                                }
                                elements::PREV_SIZE => {
                                    ebml::write_uint_element(
                                        out,
                                        elements::PREV_SIZE,
                                        prev_cluster_total,
                                    )?;
                                }
                                _ => tree.copy_entirely(ch, input, out, progress)?,
                            }
                            child = tree.next_sibling(ch, input)?;
                        }
                        prev_cluster_total = 4
                            + ebml::calculate_size_denotation_length(cluster_size) as u64
                            + cluster_size;
                        progress.update_percentage(
                            (out.stream_position()? - segment_data_offset) as f64
                                / plan.total_data_size as f64
                                * 100.0,
                        );
                        size_index += 1;
                        cluster = tree.sibling_by_id(cl, elements::CLUSTER, input)?;
                    }
                } else {
                    // clusters stay put; only their Position children must be
                    // adjusted to the shifted segment data offset
                    let mut cluster = tree.child_by_id(l0, elements::CLUSTER, input)?;
                    while let Some(cl) = cluster {
                        if progress.is_aborted() {
                            return Err(Error::Aborted);
                        }
                        let mut child = tree.first_child(cl, input)?;
                        while let Some(ch) = child {
                            tree.parse(ch, input)?;
                            if tree.id(ch) == elements::POSITION {
                                let new_value = tree.start_offset(cl) - segment_data_offset;
                                let data_size = tree.data_size(ch);
                                if data_size > 8
                                    || ebml::calculate_uint_length(new_value) as u64 > data_size
                                {
                                    // the new value does not fit; the element
                                    // cannot shrink either, so it is voided
                                    out.seek(SeekFrom::Start(tree.start_offset(ch)))?;
                                    out.write_all(&[elements::VOID as u8])?;
                                } else {
                                    let mut buffer = [0u8; 8];
                                    let length = ebml::make_uint_padded(
                                        new_value,
                                        data_size as u32,
                                        &mut buffer,
                                    );
                                    out.seek(SeekFrom::Start(tree.data_offset(ch)))?;
                                    out.write_all(&buffer[..length as usize])?;
                                }
                            }
                            child = tree.next_sibling(ch, input)?;
                        }
                        cluster = tree.sibling_by_id(cl, elements::CLUSTER, input)?;
                    }
                    out.seek(SeekFrom::Start(plan.cluster_end_offset))?;
                }

                if args.new_cues_pos == ElementPosition::AfterData && plan.cues_element.is_some()
                {
                    plan.cues_updater.make(out)?;
                }
                if args.new_tag_pos == ElementPosition::AfterData
                    && segment_index == args.last_segment_index
                {
                    write_tags_block(out, args.tag_makers, args.tag_elements_size)?;
                    write_attachments_block(
                        out,
                        input,
                        args.attachment_makers,
                        args.attached_file_elements_size,
                        progress,
                    )?;
                }

                segment_index += 1;
            }
            _ => {
                // unknown top-level elements are copied verbatim
                tree.copy_entirely(l0, input, out, progress)?;
            }
        }
        level0 = tree.next_sibling(l0, input)?;
    }

    let new_size = out.stream_position()?;
    if !args.rewrite && new_size < out.size() {
        out.set_len(new_size)?;
    }
    out.flush()?;
    Ok(crc32_offsets)
}

fn write_tags_block<W: Write>(
    out: &mut W,
    tag_makers: &[TagMaker],
    tag_elements_size: u64,
) -> Result<()> {
    if tag_elements_size == 0 {
        return Ok(());
    }
    ebml::write_id(out, elements::TAGS)?;
    ebml::write_size(out, tag_elements_size)?;
    for maker in tag_makers {
        if maker.required_size() > 3 {
            maker.make(out)?;
        }
    }
    Ok(())
}

fn write_attachments_block<W: Write>(
    out: &mut W,
    input: &mut MediaFile,
    attachment_makers: &[AttachmentMaker],
    attached_file_elements_size: u64,
    progress: &dyn ProgressSink,
) -> Result<()> {
    if attached_file_elements_size == 0 {
        return Ok(());
    }
    ebml::write_id(out, elements::ATTACHMENTS)?;
    ebml::write_size(out, attached_file_elements_size)?;
    for maker in attachment_makers {
        maker.make(out, input, progress)?;
    }
    Ok(())
}

/// Write a Void element of exactly `total` bytes.
///
/// The size denotation is one byte when the content fits (`total - 2 <=
/// 0x7E`) and eight bytes otherwise, so any total of two or more bytes can
/// be produced exactly.
fn write_void<W: Write>(out: &mut W, total: u64) -> Result<()> {
    if total < 2 {
        return Err(Error::invalid_data(
            "padding of a single byte cannot be expressed as a Void element",
        ));
    }
    let content = if total - 2 <= 0x7E {
        out.write_all(&[elements::VOID as u8, 0x80 | (total - 2) as u8])?;
        total - 2
    } else {
        out.write_u8(elements::VOID as u8)?;
        let content = total - 9;
        let mut buffer = content.to_be_bytes();
        buffer[0] = 0x01;
        out.write_all(&buffer)?;
        content
    };
    let zeroes = [0u8; 0x2000];
    let mut remaining = content;
    while remaining > 0 {
        let chunk = remaining.min(zeroes.len() as u64) as usize;
        out.write_all(&zeroes[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}
