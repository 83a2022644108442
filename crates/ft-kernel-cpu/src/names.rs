//! Kernel sources and entry points shared by plan builders and devices.

pub const SMOOTH_L1_LOSS_FILE: &str = "SmoothL1Loss.cpp";
pub const REDUCE_FILE: &str = "Reduce.cpp";
pub const TRIPLET_MARGIN_LOSS_FILE: &str = "TripletMarginLoss.cpp";
pub const RRELU_FILE: &str = "RReLU.cpp";
pub const BCE_LOGITS_LOSS_FILE: &str = "BCELogitsLoss.cpp";

pub const SMOOTH_L1_LOSS_UNREDUCED_FORWARD_CONTIGUOUS: &str =
    "SmoothL1LossUnreducedForwardContiguous";
pub const SMOOTH_L1_LOSS_UNREDUCED_FORWARD_5D: &str = "SmoothL1LossUnreducedForward5d";
pub const SMOOTH_L1_LOSS_REDUCED_FORWARD_5D: &str = "SmoothL1LossReducedForward5d";
pub const SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_CONTIGUOUS: &str =
    "SmoothL1LossUnreducedBackwardContiguous";
pub const SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_5D: &str = "SmoothL1LossUnreducedBackward5d";
pub const SMOOTH_L1_LOSS_REDUCED_BACKWARD_5D: &str = "SmoothL1LossReducedBackward5d";

pub const REDUCE_SUM: &str = "ReduceSum";

pub const TRIPLET_MARGIN_LOSS_UNREDUCED_FORWARD_2D: &str = "TripletMarginLossUnreducedForward2d";
pub const TRIPLET_MARGIN_LOSS_REDUCED_FORWARD_2D: &str = "TripletMarginLossReducedForward2d";
pub const TRIPLET_MARGIN_LOSS_UNREDUCED_BACKWARD_2D: &str = "TripletMarginLossUnreducedBackward2d";
pub const TRIPLET_MARGIN_LOSS_REDUCED_BACKWARD_2D: &str = "TripletMarginLossReducedBackward2d";

pub const BCE_LOGITS_LOSS_REDUCED_FORWARD_5D: &str = "BCELogitsLossReducedForward5d";
pub const BCE_LOGITS_LOSS_REDUCED_BACKWARD_5D: &str = "BCELogitsLossReducedBackward5d";

pub const RRELU_FORWARD_5D: &str = "RReLUForward5d";
pub const RRELU_BACKWARD_5D: &str = "RReLUBackward5d";
